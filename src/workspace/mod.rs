pub mod git;
pub mod manager;

pub use git::{ChangeKind, CommitOutcome, FileChange, Git2Ops, GitOps};
pub use manager::{Workspace, WorkspaceManager, WorkspaceMode};
