use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crew::schema::{ImplementationReport, ReviewVerdict};
use crate::error::{CrewError, GitError, PushError, WorkspaceError};
use crate::workspace::manager::path_slug;
use crate::workspace::FileChange;

/// What the caller asks for. Not modified once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub repo_path: PathBuf,
    pub issue_description: String,
    /// Generated from the issue description when absent.
    pub branch_name: Option<String>,
    pub use_worktree: bool,
    pub auto_push: bool,
    pub verbose: bool,
    /// Skip research and review.
    pub fast_mode: bool,
    /// Accept the task description without the length and entropy checks.
    #[serde(default)]
    pub skip_validation: bool,
}

impl WorkflowRequest {
    pub fn new(repo_path: impl Into<PathBuf>, issue_description: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            issue_description: issue_description.into(),
            branch_name: None,
            use_worktree: false,
            auto_push: true,
            verbose: false,
            fast_mode: false,
            skip_validation: false,
        }
    }
}

/// Shannon entropy of `text` in bits per character. Zero for empty input.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_default() += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Reject task descriptions too short or too repetitive to act on.
pub fn validate_task(text: &str, min_chars: usize, min_entropy: f64) -> Result<(), StageFailure> {
    let chars = text.chars().count();
    if chars < min_chars {
        return Err(StageFailure::new(
            "InvalidRequest",
            format!(
                "task description is {chars} characters; at least {min_chars} are required. \
Describe the change in plain language."
            ),
        ));
    }
    let entropy = shannon_entropy(text);
    if entropy < min_entropy {
        return Err(StageFailure::new(
            "InvalidRequest",
            format!(
                "task description looks repetitive or random \
(entropy {entropy:.2} bits/char, minimum {min_entropy}). Describe the change in plain language."
            ),
        ));
    }
    Ok(())
}

const BRANCH_SLUG_CHARS: usize = 50;

/// `<prefix><slug>` built from the first 50 characters of the task.
pub fn generated_branch_name(prefix: &str, issue_description: &str) -> String {
    let head: String = issue_description
        .chars()
        .take(BRANCH_SLUG_CHARS)
        .collect::<String>()
        .to_lowercase()
        .replace(['.', '_'], "-");
    let slug = path_slug(&head);
    if slug.is_empty() {
        format!("{prefix}task")
    } else {
        format!("{prefix}{slug}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    BranchSetup,
    Research,
    Implement,
    Review,
    Push,
    Complete,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::BranchSetup => "branch_setup",
            Stage::Research => "research",
            Stage::Implement => "implement",
            Stage::Review => "review",
            Stage::Push => "push",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed | Stage::Cancelled)
    }

    pub fn can_transition_to(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            // Once a push has started it runs to completion
            (from, Cancelled) => !from.is_terminal() && *from != Push,
            (Init, BranchSetup)
            | (BranchSetup, Research)
            | (Research, Implement)
            | (Implement, Review)
            | (Review, Push)
            | (Review, Complete)
            | (Push, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: String,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Outcome of running one stage. Both failure variants end the run;
/// `Retryable` marks the run as worth retrying as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(serde_json::Value),
    Retryable(StageFailure),
    Fatal(StageFailure),
}

impl StageResult {
    pub fn fatal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StageResult::Fatal(StageFailure::new(kind, message))
    }
}

impl From<WorkspaceError> for StageResult {
    fn from(e: WorkspaceError) -> Self {
        StageResult::Fatal(StageFailure::new(e.kind_name(), e.to_string()))
    }
}

impl From<GitError> for StageResult {
    fn from(e: GitError) -> Self {
        StageResult::Fatal(StageFailure::new("GitError", e.to_string()))
    }
}

impl From<CrewError> for StageResult {
    fn from(e: CrewError) -> Self {
        let failure = StageFailure::new(e.kind_name(), e.to_string());
        if e.is_retryable() {
            StageResult::Retryable(failure)
        } else {
            StageResult::Fatal(failure)
        }
    }
}

impl From<PushError> for StageResult {
    fn from(e: PushError) -> Self {
        let failure = StageFailure::new(e.kind_name(), e.to_string());
        match e {
            PushError::Transient { .. } => StageResult::Retryable(failure),
            PushError::Rejected { .. } | PushError::Other(_) => StageResult::Fatal(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
            StageOutcome::Skipped => "skipped",
            StageOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowStatus::Completed => 0,
            WorkflowStatus::Failed => 1,
            WorkflowStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitRecord {
    Committed { sha: String },
    NoChanges,
    #[default]
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub verdict: ReviewVerdict,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub stage: Stage,
    /// Typed error name, e.g. `PushError::Rejected`.
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// Mutable record threaded through one run. Only the orchestrator writes it.
#[derive(Debug)]
pub struct WorkflowState {
    pub run_id: Uuid,
    pub stage: Stage,
    pub branch_name: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub research: Option<serde_json::Value>,
    pub implementation: Option<ImplementationReport>,
    pub changes: Vec<FileChange>,
    pub commit: CommitRecord,
    pub review: Option<ReviewRecord>,
    pub pushed: bool,
    pub error: Option<WorkflowError>,
    pub stages: Vec<StageRecord>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            stage: Stage::Init,
            branch_name: None,
            workspace_path: None,
            research: None,
            implementation: None,
            changes: Vec::new(),
            commit: CommitRecord::NotAttempted,
            review: None,
            pushed: false,
            error: None,
            stages: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Move to `next`, returning false (and staying put) if the edge is not
    /// part of the state machine.
    pub fn transition(&mut self, next: Stage) -> bool {
        if !self.stage.can_transition_to(next) {
            tracing::error!(from = %self.stage, to = %next, "Invalid stage transition");
            return false;
        }
        self.stage = next;
        true
    }

    pub fn into_result(self, final_status: WorkflowStatus) -> WorkflowResult {
        WorkflowResult {
            run_id: self.run_id,
            final_status,
            branch_name: self.branch_name,
            workspace_path: self.workspace_path,
            changes_made: self.changes,
            commit: self.commit,
            pushed: self.pushed,
            review: self.review,
            error: self.error,
            stages: self.stages,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// The terminal summary of a run; the only thing handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub final_status: WorkflowStatus,
    pub branch_name: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub changes_made: Vec<FileChange>,
    pub commit: CommitRecord,
    pub pushed: bool,
    pub review: Option<ReviewRecord>,
    pub error: Option<WorkflowError>,
    pub stages: Vec<StageRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn stage_outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.stage == stage)
            .map(|r| r.outcome)
    }
}
