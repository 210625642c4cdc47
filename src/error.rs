use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::crew::CrewKind;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Claude API error: {0}")]
    ClaudeApi(String),

    #[error("Claude API rate limited: {0}")]
    ClaudeRateLimited(String),

    #[error("Observability error: {0}")]
    Observability(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// A git operation that failed for a reason the caller cannot act on
/// beyond reporting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("git {operation} failed: {message}")]
pub struct GitError {
    pub operation: &'static str,
    pub message: String,
    /// The object the operation tried to create was already there.
    pub already_exists: bool,
}

impl GitError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
            already_exists: false,
        }
    }

    pub fn from_git2(operation: &'static str, e: git2::Error) -> Self {
        Self {
            already_exists: e.code() == git2::ErrorCode::Exists,
            ..Self::new(operation, e.message())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("Not a git repository: {}", path.display())]
    InvalidRepository { path: PathBuf },

    #[error("Branch '{branch}' already exists and cannot be reused")]
    BranchExists { branch: String },

    #[error("Worktree path is already taken: {}", path.display())]
    WorktreeConflict { path: PathBuf },

    #[error("Working tree at {} has uncommitted changes", path.display())]
    DirtyTree { path: PathBuf },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl WorkspaceError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkspaceError::InvalidRepository { .. } => "WorkspaceError::InvalidRepository",
            WorkspaceError::BranchExists { .. } => "WorkspaceError::BranchExists",
            WorkspaceError::WorktreeConflict { .. } => "WorkspaceError::WorktreeConflict",
            WorkspaceError::DirtyTree { .. } => "WorkspaceError::DirtyTree",
            WorkspaceError::Git(_) => "GitError",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrewError {
    #[error("{kind} crew timed out after {}s", after.as_secs())]
    Timeout { kind: CrewKind, after: Duration },

    #[error("{kind} crew provider failed: {message}")]
    ProviderError { kind: CrewKind, message: String },

    #[error("{kind} crew returned invalid output: {message}")]
    InvalidOutput { kind: CrewKind, message: String },
}

impl CrewError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            CrewError::Timeout { .. } => "CrewError::Timeout",
            CrewError::ProviderError { .. } => "CrewError::ProviderError",
            CrewError::InvalidOutput { .. } => "CrewError::InvalidOutput",
        }
    }

    /// Whether re-running the whole workflow by hand has a reasonable
    /// chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CrewError::InvalidOutput { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The remote refused the update (diverged history, protected ref).
    #[error("Push rejected by remote: {reason}")]
    Rejected { reason: String },

    /// Network or auth trouble that persisted through every retry.
    #[error("Push failed after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    #[error(transparent)]
    Other(#[from] GitError),
}

impl PushError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PushError::Rejected { .. } => "PushError::Rejected",
            PushError::Transient { .. } => "PushError::Transient",
            PushError::Other(_) => "GitError",
        }
    }
}
