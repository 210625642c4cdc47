use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::crew::claude::ToolDefinition;
use crate::crew::tools::{Tool, ToolOutput};
use crate::error::Result;
use crate::workspace::{ChangeKind, GitOps};

/// Lists what the run has changed: everything since `base` when set,
/// including committed work, or uncommitted changes against HEAD.
pub struct ChangedFilesTool {
    git: Arc<dyn GitOps>,
    base: Option<String>,
}

impl ChangedFilesTool {
    pub fn new(git: Arc<dyn GitOps>, base: Option<String>) -> Self {
        Self { git, base }
    }
}

fn label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Added => "added",
        ChangeKind::Modified => "modified",
        ChangeKind::Deleted => "deleted",
        ChangeKind::Renamed => "renamed",
        ChangeKind::TypeChanged => "type changed",
    }
}

#[async_trait]
impl Tool for ChangedFilesTool {
    fn name(&self) -> &str {
        "changed_files"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "changed_files".to_string(),
            description: "List files changed on this branch since work on the task started, \
including changes that are already committed."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(
        &self,
        workspace_root: &Path,
        _input: serde_json::Value,
    ) -> Result<ToolOutput> {
        let changes = match &self.base {
            Some(base) => self.git.changes_since(workspace_root, base).await,
            None => self.git.summarize_diff(workspace_root).await,
        };
        match changes {
            Ok(changes) if changes.is_empty() => {
                Ok(ToolOutput::Success("No changes".to_string()))
            }
            Ok(changes) => Ok(ToolOutput::Success(
                changes
                    .iter()
                    .map(|c| format!("{} ({})", c.path, label(c.kind)))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )),
            Err(e) => Ok(ToolOutput::Error(e.to_string())),
        }
    }
}
