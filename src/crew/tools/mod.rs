/// Pull a required string parameter out of a tool input, or return a
/// recoverable tool error.
macro_rules! require_param {
    ($input:expr, $name:literal) => {
        match $input[$name].as_str() {
            Some(v) => v,
            None => {
                return Ok($crate::crew::tools::ToolOutput::Error(format!(
                    "Missing '{}' parameter",
                    $name
                )))
            }
        }
    };
}
pub(crate) use require_param;

pub mod changes;
pub mod fs;
pub mod search;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::CrewConfig;
use crate::crew::claude::ToolDefinition;
use crate::crew::CrewKind;
use crate::error::Result;
use crate::workspace::GitOps;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum ToolOutput {
    /// Normal text result returned to the model.
    Success(String),
    /// Error result returned to the model (it can recover).
    Error(String),
}

/// Resolve `requested` under `workspace_root`, refusing anything that
/// escapes it through `..`, absolute paths or symlinks.
pub fn resolve_in_workspace(
    workspace_root: &Path,
    requested: &str,
) -> std::result::Result<PathBuf, String> {
    let relative = Path::new(requested);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!("Path escapes the workspace: {requested}"));
    }
    if relative
        .components()
        .find(|c| !matches!(c, Component::CurDir))
        .is_some_and(|c| c.as_os_str() == ".git")
    {
        return Err("Access to .git is not allowed".to_string());
    }

    let canonical_root = workspace_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve workspace root: {e}"))?;
    let full_path = canonical_root.join(relative);

    // Symlinks may still point outside; check the nearest existing ancestor
    let mut existing = full_path.as_path();
    while !existing.exists() {
        existing = existing
            .parent()
            .ok_or_else(|| "Invalid file path".to_string())?;
    }
    let canonical_existing = existing
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path: {e}"))?;
    if !canonical_existing.starts_with(&canonical_root) {
        return Err(format!("Path escapes the workspace: {requested}"));
    }

    Ok(full_path)
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// The tool set a crew of `kind` may use. Only implementation can write.
    /// Tools for one crew. `changed_files` measures against `base_commit`
    /// when given, otherwise against HEAD.
    pub fn for_crew(
        kind: CrewKind,
        config: &CrewConfig,
        git: Arc<dyn GitOps>,
        base_commit: Option<String>,
    ) -> Self {
        let mut tools: Vec<Box<dyn Tool>> = vec![
            Box::new(fs::ReadFileTool::new(config.max_file_size_bytes)),
            Box::new(fs::ListDirectoryTool),
            Box::new(search::SearchCodeTool::new(config.max_search_results)),
        ];

        match kind {
            CrewKind::Research => {}
            CrewKind::Implementation => {
                tools.push(Box::new(fs::WriteFileTool));
                tools.push(Box::new(fs::DeleteFileTool));
                tools.push(Box::new(changes::ChangedFilesTool::new(git, base_commit)));
            }
            CrewKind::Review => {
                tools.push(Box::new(changes::ChangedFilesTool::new(git, base_commit)));
            }
        }

        Self { tools }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }
}
