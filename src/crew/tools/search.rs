use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;

use crate::crew::claude::ToolDefinition;
use crate::crew::tools::{require_param, resolve_in_workspace, Tool, ToolOutput};
use crate::error::Result;

const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "vendor"];

/// Recursive grep over the workspace.
pub struct SearchCodeTool {
    max_results: usize,
}

impl SearchCodeTool {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "search_code"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_code".to_string(),
            description: "Search the codebase for a pattern. Returns matching lines with file \
paths and line numbers."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "grep-compatible regular expression"
                    },
                    "path": {
                        "type": "string",
                        "description": "Optional subdirectory to restrict the search to"
                    },
                    "include": {
                        "type": "string",
                        "description": "Optional file glob, e.g. '*.rs'"
                    }
                },
                "required": ["pattern"]
            }),
        }
    }

    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput> {
        let pattern = require_param!(input, "pattern");
        let sub_path = input["path"].as_str().unwrap_or(".");

        let search_dir = match resolve_in_workspace(workspace_root, sub_path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::Error(e)),
        };
        if !search_dir.is_dir() {
            return Ok(ToolOutput::Error(format!(
                "Search directory does not exist: {sub_path}"
            )));
        }

        let mut args = vec!["-rnI".to_string(), "--max-count=5".to_string()];
        if let Some(include) = input["include"].as_str() {
            args.push(format!("--include={include}"));
        }
        args.extend(EXCLUDED_DIRS.iter().map(|d| format!("--exclude-dir={d}")));
        args.push("-e".to_string());
        args.push(pattern.to_string());
        args.push(".".to_string());

        let output = tokio::process::Command::new("grep")
            .args(&args)
            .current_dir(&search_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => return Ok(ToolOutput::Error(format!("Search failed: {e}"))),
        };

        // grep exits 1 on no match and 2 on a bad pattern
        if output.status.code() == Some(2) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ToolOutput::Error(format!("Search failed: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(ToolOutput::Success("No matches found".to_string()));
        }

        let total = stdout.lines().count();
        let shown: Vec<&str> = stdout.lines().take(self.max_results).collect();
        let result = shown.join("\n");
        if total > self.max_results {
            Ok(ToolOutput::Success(format!(
                "{result}\n\n... ({} more matches truncated)",
                total - self.max_results
            )))
        } else {
            Ok(ToolOutput::Success(result))
        }
    }
}
