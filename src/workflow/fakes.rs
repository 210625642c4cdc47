//! In-memory collaborators for orchestrator tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::crew::{CrewInvoker, CrewKind, CrewOutput, CrewRequest};
use crate::error::{AppError, CrewError, GitError, PushError, Result};
use crate::workflow::observer::{StageEvent, StageObserver};
use crate::workflow::types::WorkflowResult;
use crate::workspace::git::{BranchState, CommitOutcome, FileChange, GitOps, PushReport};

/// HEAD of every fake repository.
pub const BASE_COMMIT: &str = "ba5e000";

pub struct FakeGit {
    pub branch_state: Mutex<BranchState>,
    pub dirty: Mutex<bool>,
    pub diff: Mutex<Vec<FileChange>>,
    pub push_result: Mutex<std::result::Result<u32, PushError>>,
    pub commit_messages: Mutex<Vec<String>>,
    pub worktrees: Mutex<Vec<PathBuf>>,
    pub branches_created: AtomicU32,
    pub worktrees_added: AtomicU32,
    pub worktrees_removed: AtomicU32,
    pub pushes: AtomicU32,
}

impl Default for FakeGit {
    fn default() -> Self {
        Self {
            branch_state: Mutex::new(BranchState::Absent),
            dirty: Mutex::new(false),
            diff: Mutex::new(Vec::new()),
            push_result: Mutex::new(Ok(1)),
            commit_messages: Mutex::new(Vec::new()),
            worktrees: Mutex::new(Vec::new()),
            branches_created: AtomicU32::new(0),
            worktrees_added: AtomicU32::new(0),
            worktrees_removed: AtomicU32::new(0),
            pushes: AtomicU32::new(0),
        }
    }
}

impl FakeGit {
    pub fn with_diff(diff: Vec<FileChange>) -> Self {
        let git = Self::default();
        *git.diff.lock().unwrap() = diff;
        git
    }

    pub fn commits(&self) -> usize {
        self.commit_messages.lock().unwrap().len()
    }
}

type GitResult<T> = std::result::Result<T, GitError>;

#[async_trait]
impl GitOps for FakeGit {
    async fn head_commit(&self, _repo: &Path) -> GitResult<String> {
        Ok(BASE_COMMIT.to_string())
    }

    async fn branch_state(&self, _repo: &Path, _branch: &str) -> GitResult<BranchState> {
        Ok(*self.branch_state.lock().unwrap())
    }

    async fn is_dirty(&self, _repo: &Path) -> GitResult<bool> {
        Ok(*self.dirty.lock().unwrap())
    }

    async fn create_branch(&self, _repo: &Path, _branch: &str) -> GitResult<()> {
        self.branches_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn checkout_branch(&self, _repo: &Path, _branch: &str) -> GitResult<()> {
        Ok(())
    }

    async fn add_worktree(
        &self,
        _repo: &Path,
        _name: &str,
        path: &Path,
        _branch: &str,
    ) -> GitResult<()> {
        std::fs::create_dir_all(path).map_err(|e| GitError::new("worktree-add", e.to_string()))?;
        self.worktrees.lock().unwrap().push(path.to_path_buf());
        self.worktrees_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, _name: &str, path: &Path) -> GitResult<()> {
        let _ = std::fs::remove_dir_all(path);
        self.worktrees.lock().unwrap().retain(|p| p != path);
        self.worktrees_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn summarize_diff(&self, _workdir: &Path) -> GitResult<Vec<FileChange>> {
        Ok(self.diff.lock().unwrap().clone())
    }

    async fn changes_since(&self, _workdir: &Path, _base: &str) -> GitResult<Vec<FileChange>> {
        Ok(self.diff.lock().unwrap().clone())
    }

    async fn commit_all(&self, _workdir: &Path, message: &str) -> GitResult<CommitOutcome> {
        let changes = self.diff.lock().unwrap().clone();
        if changes.is_empty() {
            return Ok(CommitOutcome::NothingToCommit);
        }
        self.commit_messages.lock().unwrap().push(message.to_string());
        Ok(CommitOutcome::Committed {
            sha: "c0ffee".to_string(),
            changes,
        })
    }

    async fn push(
        &self,
        _workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> std::result::Result<PushReport, PushError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let attempts = self.push_result.lock().unwrap().clone()?;
        Ok(PushReport {
            remote: remote.to_string(),
            branch: branch.to_string(),
            attempts,
        })
    }
}

/// Scripted crews. Unscripted kinds succeed with a minimal valid payload.
#[derive(Default)]
pub struct FakeCrews {
    pub scripted: Mutex<HashMap<CrewKind, std::result::Result<CrewOutput, CrewError>>>,
    pub calls: Mutex<Vec<CrewKind>>,
    pub requests: Mutex<Vec<CrewRequest>>,
    /// Cancel this token while the given crew is running.
    pub cancel_during: Mutex<Option<(CrewKind, CancellationToken)>>,
    /// Panic inside this crew.
    pub panic_on: Mutex<Option<CrewKind>>,
}

impl FakeCrews {
    pub fn script(&self, kind: CrewKind, result: std::result::Result<CrewOutput, CrewError>) {
        self.scripted.lock().unwrap().insert(kind, result);
    }

    pub fn calls_for(&self, kind: CrewKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn default_output(kind: CrewKind) -> CrewOutput {
    let payload = match kind {
        CrewKind::Research => serde_json::json!({"findings": "edit src/lib.rs"}),
        CrewKind::Implementation => serde_json::json!({"summary": "updated src/lib.rs"}),
        CrewKind::Review => serde_json::json!({"verdict": "pass", "summary": "looks fine"}),
    };
    CrewOutput::success(payload)
}

#[async_trait]
impl CrewInvoker for FakeCrews {
    async fn invoke(
        &self,
        kind: CrewKind,
        request: CrewRequest,
    ) -> std::result::Result<CrewOutput, CrewError> {
        self.calls.lock().unwrap().push(kind);
        self.requests.lock().unwrap().push(request);

        let panics = *self.panic_on.lock().unwrap() == Some(kind);
        if panics {
            panic!("{kind} crew blew up");
        }

        if let Some((target, token)) = self.cancel_during.lock().unwrap().as_ref() {
            if *target == kind {
                token.cancel();
            }
        }

        match self.scripted.lock().unwrap().get(&kind) {
            Some(result) => result.clone(),
            None => Ok(default_output(kind)),
        }
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<StageEvent>>,
    pub finished: Mutex<Vec<WorkflowResult>>,
}

#[async_trait]
impl StageObserver for RecordingObserver {
    async fn stage_finished(&self, event: &StageEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn run_finished(&self, result: &WorkflowResult) -> Result<()> {
        self.finished.lock().unwrap().push(result.clone());
        Ok(())
    }
}

pub struct FailingObserver;

#[async_trait]
impl StageObserver for FailingObserver {
    async fn stage_finished(&self, _event: &StageEvent) -> Result<()> {
        Err(AppError::Observability("sink unavailable".to_string()))
    }

    async fn run_finished(&self, _result: &WorkflowResult) -> Result<()> {
        Err(AppError::Observability("sink unavailable".to_string()))
    }
}

/// Never finishes an emission.
pub struct StalledObserver;

#[async_trait]
impl StageObserver for StalledObserver {
    async fn stage_finished(&self, _event: &StageEvent) -> Result<()> {
        std::future::pending().await
    }

    async fn run_finished(&self, _result: &WorkflowResult) -> Result<()> {
        std::future::pending().await
    }
}

/// Panics on every emission.
pub struct PanickingObserver;

#[async_trait]
impl StageObserver for PanickingObserver {
    async fn stage_finished(&self, event: &StageEvent) -> Result<()> {
        panic!("observer failed on {}", event.stage)
    }

    async fn run_finished(&self, _result: &WorkflowResult) -> Result<()> {
        panic!("observer failed on the run result")
    }
}
