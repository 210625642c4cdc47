use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::error::WorkspaceError;
use crate::workspace::git::{BranchState, GitOps};

/// Hands out one isolated working directory per run and takes it back.
pub struct WorkspaceManager {
    git: Arc<dyn GitOps>,
    worktree_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// Work happens directly in the caller's checkout.
    InPlace,
    /// A linked worktree registered under `name`.
    Worktree { name: String },
}

/// A checked-out workspace ready for the crews to work in.
#[derive(Debug)]
pub struct Workspace {
    pub repo_path: PathBuf,
    pub path: PathBuf,
    pub branch: String,
    pub mode: WorkspaceMode,
    /// Commit the branch started from; the run's changes are measured
    /// against it.
    pub base_commit: String,
    released: bool,
}

impl Workspace {
    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `-` and collapse runs.
pub(crate) fn path_slug(input: &str) -> String {
    let mapped: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

impl WorkspaceManager {
    pub fn new(git: Arc<dyn GitOps>, config: &WorkspaceConfig) -> Self {
        Self {
            git,
            worktree_root: config.worktree_root.clone(),
        }
    }

    /// Acquire the workspace for one run.
    ///
    /// On error nothing has been created, so there is nothing to release.
    pub async fn acquire(
        &self,
        repo_path: &Path,
        branch: &str,
        use_worktree: bool,
        run_id: Uuid,
    ) -> Result<Workspace, WorkspaceError> {
        if !repo_path.join(".git").exists() {
            return Err(WorkspaceError::InvalidRepository {
                path: repo_path.to_path_buf(),
            });
        }

        let state = self.git.branch_state(repo_path, branch).await?;
        // Reusable branches always sit at HEAD, so HEAD is where the run starts
        let base_commit = self.git.head_commit(repo_path).await?;

        if use_worktree {
            self.acquire_worktree(repo_path, branch, state, base_commit, run_id)
                .await
        } else {
            self.acquire_in_place(repo_path, branch, state, base_commit)
                .await
        }
    }

    async fn acquire_in_place(
        &self,
        repo_path: &Path,
        branch: &str,
        state: BranchState,
        base_commit: String,
    ) -> Result<Workspace, WorkspaceError> {
        if self.git.is_dirty(repo_path).await? {
            return Err(WorkspaceError::DirtyTree {
                path: repo_path.to_path_buf(),
            });
        }

        match state {
            BranchState::Absent => self.git.create_branch(repo_path, branch).await?,
            BranchState::AtHead => self.git.checkout_branch(repo_path, branch).await?,
            BranchState::CheckedOut => {
                tracing::info!(branch = %branch, "Reusing branch that is already checked out");
            }
            BranchState::Diverged => {
                return Err(WorkspaceError::BranchExists {
                    branch: branch.to_string(),
                });
            }
        }

        tracing::info!(path = %repo_path.display(), branch = %branch, "Workspace ready (in place)");

        Ok(Workspace {
            repo_path: repo_path.to_path_buf(),
            path: repo_path.to_path_buf(),
            branch: branch.to_string(),
            mode: WorkspaceMode::InPlace,
            base_commit,
            released: false,
        })
    }

    async fn acquire_worktree(
        &self,
        repo_path: &Path,
        branch: &str,
        state: BranchState,
        base_commit: String,
        run_id: Uuid,
    ) -> Result<Workspace, WorkspaceError> {
        if matches!(state, BranchState::CheckedOut | BranchState::Diverged) {
            return Err(WorkspaceError::BranchExists {
                branch: branch.to_string(),
            });
        }

        let (name, path) = self.worktree_location(repo_path, branch, run_id);

        if path.exists() {
            return Err(WorkspaceError::WorktreeConflict { path });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WorkspaceError::Git(crate::error::GitError::new(
                    "worktree-add",
                    format!("Failed to create worktree root: {e}"),
                ))
            })?;
        }

        if let Err(e) = self.git.add_worktree(repo_path, &name, &path, branch).await {
            // Another process won the race for the same path or name
            if path.exists() || e.already_exists {
                return Err(WorkspaceError::WorktreeConflict { path });
            }
            return Err(e.into());
        }

        tracing::info!(path = %path.display(), branch = %branch, "Workspace ready (worktree)");

        Ok(Workspace {
            repo_path: repo_path.to_path_buf(),
            path,
            branch: branch.to_string(),
            mode: WorkspaceMode::Worktree { name },
            base_commit,
            released: false,
        })
    }

    /// Release a workspace. Safe to call more than once; failures are logged
    /// rather than returned since the branch is the durable artifact.
    pub async fn release(&self, workspace: &mut Workspace) {
        if workspace.released {
            return;
        }
        workspace.released = true;

        if let WorkspaceMode::Worktree { name } = &workspace.mode {
            match self
                .git
                .remove_worktree(&workspace.repo_path, name, &workspace.path)
                .await
            {
                Ok(()) => {
                    tracing::info!(path = %workspace.path.display(), "Worktree removed");
                }
                Err(e) => {
                    tracing::warn!(
                        path = %workspace.path.display(),
                        error = %e,
                        "Failed to remove worktree"
                    );
                }
            }
        }
    }

    /// Worktree name and directory for a run. The run id suffix keeps
    /// simultaneous runs on the same branch name from colliding.
    fn worktree_location(&self, repo_path: &Path, branch: &str, run_id: Uuid) -> (String, PathBuf) {
        let id = run_id.simple().to_string();
        let suffix = &id[..8];
        let name = format!("{}-{suffix}", path_slug(branch));
        let repo_name = repo_path
            .file_name()
            .map(|n| path_slug(&n.to_string_lossy()))
            .unwrap_or_else(|| "repo".to_string());

        let root = self
            .worktree_root
            .clone()
            .or_else(|| repo_path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| repo_path.to_path_buf());

        let path = root.join(format!("{repo_name}-{name}"));
        (name, path)
    }
}
