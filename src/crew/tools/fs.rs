use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use crate::crew::claude::ToolDefinition;
use crate::crew::tools::{require_param, resolve_in_workspace, Tool, ToolOutput};
use crate::error::Result;

fn path_only_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": description
            }
        },
        "required": ["path"]
    })
}

pub struct ReadFileTool {
    max_file_size: usize,
}

impl ReadFileTool {
    pub fn new(max_file_size: usize) -> Self {
        Self { max_file_size }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read the contents of a file as text. Read code before changing it."
                .to_string(),
            input_schema: path_only_schema("Path relative to the repository root"),
        }
    }

    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput> {
        let path_str = require_param!(input, "path");
        let full_path = match resolve_in_workspace(workspace_root, path_str) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::Error(e)),
        };

        if !full_path.is_file() {
            return Ok(ToolOutput::Error(format!("File not found: {path_str}")));
        }

        let metadata = tokio::fs::metadata(&full_path).await?;
        if metadata.len() as usize > self.max_file_size {
            return Ok(ToolOutput::Error(format!(
                "File is too large ({} bytes, max {} bytes)",
                metadata.len(),
                self.max_file_size
            )));
        }

        match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => Ok(ToolOutput::Success(content)),
            Err(e) => Ok(ToolOutput::Error(format!("Failed to read file: {e}"))),
        }
    }
}

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_directory".to_string(),
            description: "List a directory. Entries are marked (file) or (dir).".to_string(),
            input_schema: path_only_schema(
                "Directory relative to the repository root; '.' for the root",
            ),
        }
    }

    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput> {
        let path_str = require_param!(input, "path");
        let full_path = match resolve_in_workspace(workspace_root, path_str) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::Error(e)),
        };

        if !full_path.is_dir() {
            return Ok(ToolOutput::Error(format!("Directory not found: {path_str}")));
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&full_path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Hidden entries, .git included
            if name.starts_with('.') {
                continue;
            }
            let kind = if entry.file_type().await?.is_dir() {
                "dir"
            } else {
                "file"
            };
            entries.push(format!("{name} ({kind})"));
        }
        entries.sort();

        if entries.is_empty() {
            Ok(ToolOutput::Success("Directory is empty".to_string()))
        } else {
            Ok(ToolOutput::Success(entries.join("\n")))
        }
    }
}

/// Creates or overwrites a file. Parent directories are created as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write the complete content of a file, creating it (and any parent \
directories) if it does not exist."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Path relative to the repository root"
                    },
                    "content": {
                        "type": "string",
                        "description": "The complete new content for the file"
                    }
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput> {
        let path_str = require_param!(input, "path");
        let content = require_param!(input, "content");
        let full_path = match resolve_in_workspace(workspace_root, path_str) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::Error(e)),
        };

        if full_path.is_dir() {
            return Ok(ToolOutput::Error(format!("{path_str} is a directory")));
        }
        let existed = full_path.exists();
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::write(&full_path, content).await {
            Ok(()) if existed => Ok(ToolOutput::Success(format!("Updated {path_str}"))),
            Ok(()) => Ok(ToolOutput::Success(format!("Created {path_str}"))),
            Err(e) => Ok(ToolOutput::Error(format!("Failed to write file: {e}"))),
        }
    }
}

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_file".to_string(),
            description: "Delete a file from the repository.".to_string(),
            input_schema: path_only_schema(
                "Path of the file to delete, relative to the repository root",
            ),
        }
    }

    async fn execute(&self, workspace_root: &Path, input: serde_json::Value) -> Result<ToolOutput> {
        let path_str = require_param!(input, "path");
        let full_path = match resolve_in_workspace(workspace_root, path_str) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutput::Error(e)),
        };

        if !full_path.is_file() {
            return Ok(ToolOutput::Error(format!("File not found: {path_str}")));
        }

        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(ToolOutput::Success(format!("Deleted {path_str}"))),
            Err(e) => Ok(ToolOutput::Error(format!("Failed to delete file: {e}"))),
        }
    }
}
