use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use git2::{
    BranchType, Cred, CredentialType, Delta, DiffOptions, ErrorClass, ErrorCode, IndexAddOption,
    PushOptions, RemoteCallbacks, Repository, Signature, Status, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};
use serde::{Deserialize, Serialize};

use crate::config::GitConfig;
use crate::error::{GitError, PushError};

/// How a local branch relates to the repository's current HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Absent,
    /// Exists, not checked out, and points at the HEAD commit.
    AtHead,
    /// The branch is what HEAD currently refers to.
    CheckedOut,
    /// Exists with a tip that differs from HEAD.
    Diverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { sha: String, changes: Vec<FileChange> },
    /// The index matched HEAD after staging; no commit was written.
    NothingToCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub remote: String,
    pub branch: String,
    pub attempts: u32,
}

/// Atomic git operations the workflow depends on.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Full sha of the commit HEAD points at.
    async fn head_commit(&self, repo: &Path) -> Result<String, GitError>;

    async fn branch_state(&self, repo: &Path, branch: &str) -> Result<BranchState, GitError>;

    /// True when tracked or untracked (non-ignored) changes exist.
    async fn is_dirty(&self, repo: &Path) -> Result<bool, GitError>;

    /// Create a branch at HEAD and check it out.
    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Add a linked worktree at `path` on `branch`, creating the branch from
    /// HEAD when it does not exist yet.
    async fn add_worktree(
        &self,
        repo: &Path,
        name: &str,
        path: &Path,
        branch: &str,
    ) -> Result<(), GitError>;

    async fn remove_worktree(&self, repo: &Path, name: &str, path: &Path) -> Result<(), GitError>;

    /// Uncommitted changes relative to HEAD.
    async fn summarize_diff(&self, workdir: &Path) -> Result<Vec<FileChange>, GitError>;

    /// Everything that differs between commit `base` and the working tree,
    /// committed or not.
    async fn changes_since(&self, workdir: &Path, base: &str)
        -> Result<Vec<FileChange>, GitError>;

    /// Stage everything and commit. Returns `NothingToCommit` when the
    /// staged tree equals HEAD's.
    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<CommitOutcome, GitError>;

    async fn push(&self, workdir: &Path, remote: &str, branch: &str)
        -> Result<PushReport, PushError>;
}

/// Validate a branch name to prevent argument injection.
/// Rejects names starting with `-` as defence in depth.
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    if name.is_empty() || name.starts_with('-') {
        return Err(GitError::new(
            "validate-branch",
            format!("Invalid branch name: '{name}'"),
        ));
    }
    Ok(())
}

/// Backoff schedule for transient push failures.
#[derive(Debug, Clone)]
pub struct PushRetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl PushRetryPolicy {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            max_retries: config.push_max_retries,
            initial_backoff: Duration::from_millis(config.push_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.push_max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Outcome of a single push attempt, before retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAttemptError {
    Rejected(String),
    Transient(String),
    Fatal(GitError),
}

/// Run `attempt` until it succeeds, is rejected, fails fatally, or the
/// retry budget for transient failures is spent.
pub async fn push_with_retry<F, Fut>(
    policy: &PushRetryPolicy,
    mut attempt: F,
) -> Result<u32, PushError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PushAttemptError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(()) => return Ok(attempts),
            Err(PushAttemptError::Rejected(reason)) => {
                return Err(PushError::Rejected { reason });
            }
            Err(PushAttemptError::Fatal(e)) => return Err(PushError::Other(e)),
            Err(PushAttemptError::Transient(reason)) => {
                if attempts > policy.max_retries {
                    return Err(PushError::Transient { attempts, reason });
                }
                let delay = policy.delay_for_retry(attempts);
                tracing::warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient push failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Sort a libgit2 push error into rejected, transient or fatal.
pub fn classify_push_error(e: &git2::Error) -> PushAttemptError {
    match e.code() {
        ErrorCode::NotFastForward => return PushAttemptError::Rejected(e.message().to_string()),
        ErrorCode::Auth | ErrorCode::Certificate | ErrorCode::Locked => {
            return PushAttemptError::Transient(e.message().to_string())
        }
        _ => {}
    }
    match e.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl | ErrorClass::Os => {
            PushAttemptError::Transient(e.message().to_string())
        }
        _ => PushAttemptError::Fatal(GitError::new("push", e.message())),
    }
}

fn change_kind(status: Status) -> Option<ChangeKind> {
    if status.intersects(Status::WT_RENAMED | Status::INDEX_RENAMED) {
        Some(ChangeKind::Renamed)
    } else if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
        Some(ChangeKind::Added)
    } else if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
        Some(ChangeKind::Deleted)
    } else if status.intersects(Status::WT_TYPECHANGE | Status::INDEX_TYPECHANGE) {
        Some(ChangeKind::TypeChanged)
    } else if status.intersects(Status::WT_MODIFIED | Status::INDEX_MODIFIED) {
        Some(ChangeKind::Modified)
    } else {
        None
    }
}

fn collect_changes(repo: &Repository) -> Result<Vec<FileChange>, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut changes: Vec<FileChange> = statuses
        .iter()
        .filter_map(|entry| {
            let kind = change_kind(entry.status())?;
            let path = entry.path()?.to_string();
            Some(FileChange { path, kind })
        })
        .collect();
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn delta_kind(delta: Delta) -> Option<ChangeKind> {
    match delta {
        Delta::Added | Delta::Untracked | Delta::Copied => Some(ChangeKind::Added),
        Delta::Deleted => Some(ChangeKind::Deleted),
        Delta::Modified => Some(ChangeKind::Modified),
        Delta::Renamed => Some(ChangeKind::Renamed),
        Delta::Typechange => Some(ChangeKind::TypeChanged),
        _ => None,
    }
}

fn collect_changes_since(repo: &Repository, base: &str) -> Result<Vec<FileChange>, git2::Error> {
    let base_tree = repo.revparse_single(base)?.peel_to_tree()?;
    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo.diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?;

    let mut changes: Vec<FileChange> = diff
        .deltas()
        .filter_map(|delta| {
            let kind = delta_kind(delta.status())?;
            let path = delta.new_file().path().or_else(|| delta.old_file().path())?;
            Some(FileChange {
                path: path.to_string_lossy().into_owned(),
                kind,
            })
        })
        .collect();
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn checkout_local_branch(repo: &Repository, branch: &str) -> Result<(), git2::Error> {
    let refname = format!("refs/heads/{branch}");
    let obj = repo.revparse_single(&refname)?;
    repo.checkout_tree(&obj, None)?;
    repo.set_head(&refname)?;
    Ok(())
}

/// `GitOps` backed by libgit2. Every call opens the repository afresh on the
/// blocking pool so the adapter holds no long-lived handles.
pub struct Git2Ops {
    author_name: String,
    author_email: String,
    token: Option<String>,
    retry: PushRetryPolicy,
}

impl Git2Ops {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            token: config.token.clone(),
            retry: PushRetryPolicy::from_config(config),
        }
    }

    async fn blocking<T, F>(operation: &'static str, f: F) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, git2::Error> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| GitError::new(operation, format!("task panicked: {e}")))?
            .map_err(|e| GitError::from_git2(operation, e))
    }

    fn push_once(
        dir: &Path,
        remote_name: &str,
        branch: &str,
        token: Option<&str>,
    ) -> Result<(), PushAttemptError> {
        let repo = Repository::open(dir)
            .map_err(|e| PushAttemptError::Fatal(GitError::from_git2("push", e)))?;
        let mut remote = repo
            .find_remote(remote_name)
            .map_err(|e| PushAttemptError::Fatal(GitError::from_git2("push", e)))?;
        let git_config = repo
            .config()
            .map_err(|e| PushAttemptError::Fatal(GitError::from_git2("push", e)))?;

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut credential_attempts = 0u32;
        {
            let mut callbacks = RemoteCallbacks::new();
            callbacks.credentials(|url, username_from_url, allowed| {
                credential_attempts += 1;
                if credential_attempts > 3 {
                    return Err(git2::Error::new(
                        ErrorCode::Auth,
                        ErrorClass::Net,
                        "no usable credentials",
                    ));
                }
                if let Some(token) = token {
                    return Cred::userpass_plaintext("x-access-token", token);
                }
                if allowed.contains(CredentialType::SSH_KEY) {
                    return Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"));
                }
                Cred::credential_helper(&git_config, url, username_from_url)
            });
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    *rejection.borrow_mut() = Some(format!("{refname}: {message}"));
                }
                Ok(())
            });

            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            remote
                .push(&[&refspec], Some(&mut push_opts))
                .map_err(|e| classify_push_error(&e))?;
        }

        match rejection.into_inner() {
            Some(reason) => Err(PushAttemptError::Rejected(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GitOps for Git2Ops {
    async fn head_commit(&self, repo: &Path) -> Result<String, GitError> {
        let dir = repo.to_path_buf();
        Self::blocking("head", move || {
            let repo = Repository::open(&dir)?;
            let commit = repo.head()?.peel_to_commit()?;
            Ok(commit.id().to_string())
        })
        .await
    }

    async fn branch_state(&self, repo: &Path, branch: &str) -> Result<BranchState, GitError> {
        validate_branch_name(branch)?;
        let dir = repo.to_path_buf();
        let branch = branch.to_string();

        Self::blocking("branch-state", move || {
            let repo = Repository::open(&dir)?;
            let found = match repo.find_branch(&branch, BranchType::Local) {
                Ok(b) => b,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(BranchState::Absent),
                Err(e) => return Err(e),
            };
            if found.is_head() {
                return Ok(BranchState::CheckedOut);
            }
            let tip = found.get().peel_to_commit()?.id();
            let head = repo.head()?.peel_to_commit()?.id();
            Ok(if tip == head {
                BranchState::AtHead
            } else {
                BranchState::Diverged
            })
        })
        .await
    }

    async fn is_dirty(&self, repo: &Path) -> Result<bool, GitError> {
        let dir = repo.to_path_buf();
        Self::blocking("status", move || {
            let repo = Repository::open(&dir)?;
            Ok(!collect_changes(&repo)?.is_empty())
        })
        .await
    }

    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        validate_branch_name(branch)?;
        let dir = repo.to_path_buf();
        let branch = branch.to_string();

        Self::blocking("create-branch", move || {
            let repo = Repository::open(&dir)?;
            let commit = repo.head()?.peel_to_commit()?;
            repo.branch(&branch, &commit, false)?;
            checkout_local_branch(&repo, &branch)
        })
        .await
    }

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        validate_branch_name(branch)?;
        let dir = repo.to_path_buf();
        let branch = branch.to_string();

        Self::blocking("checkout", move || {
            let repo = Repository::open(&dir)?;
            checkout_local_branch(&repo, &branch)
        })
        .await
    }

    async fn add_worktree(
        &self,
        repo: &Path,
        name: &str,
        path: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        validate_branch_name(branch)?;
        let dir = repo.to_path_buf();
        let name = name.to_string();
        let path: PathBuf = path.to_path_buf();
        let branch = branch.to_string();

        Self::blocking("worktree-add", move || {
            let repo = Repository::open(&dir)?;
            let local = match repo.find_branch(&branch, BranchType::Local) {
                Ok(b) => b,
                Err(e) if e.code() == ErrorCode::NotFound => {
                    let commit = repo.head()?.peel_to_commit()?;
                    repo.branch(&branch, &commit, false)?
                }
                Err(e) => return Err(e),
            };
            let reference = local.into_reference();
            let mut opts = WorktreeAddOptions::new();
            opts.reference(Some(&reference));
            repo.worktree(&name, &path, Some(&opts))?;
            Ok(())
        })
        .await
    }

    async fn remove_worktree(&self, repo: &Path, name: &str, path: &Path) -> Result<(), GitError> {
        let dir = repo.to_path_buf();
        let name = name.to_string();

        Self::blocking("worktree-remove", move || {
            let repo = Repository::open(&dir)?;
            let worktree = repo.find_worktree(&name)?;
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            worktree.prune(Some(&mut opts))
        })
        .await?;

        // libgit2 leaves the directory behind when it contains untracked content
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| GitError::new("worktree-remove", e.to_string()))?;
        }
        Ok(())
    }

    async fn summarize_diff(&self, workdir: &Path) -> Result<Vec<FileChange>, GitError> {
        let dir = workdir.to_path_buf();
        Self::blocking("diff", move || {
            let repo = Repository::open(&dir)?;
            collect_changes(&repo)
        })
        .await
    }

    async fn changes_since(
        &self,
        workdir: &Path,
        base: &str,
    ) -> Result<Vec<FileChange>, GitError> {
        let dir = workdir.to_path_buf();
        let base = base.to_string();
        Self::blocking("diff-base", move || {
            let repo = Repository::open(&dir)?;
            collect_changes_since(&repo, &base)
        })
        .await
    }

    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<CommitOutcome, GitError> {
        let dir = workdir.to_path_buf();
        let message = message.to_string();
        let author_name = self.author_name.clone();
        let author_email = self.author_email.clone();

        Self::blocking("commit", move || {
            let repo = Repository::open(&dir)?;
            let changes = collect_changes(&repo)?;

            let mut index = repo.index()?;
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
            // add_all does not drop entries for files deleted from the work tree
            index.update_all(["*"].iter(), None)?;
            index.write()?;
            let tree_oid = index.write_tree()?;

            let parent = repo.head()?.peel_to_commit()?;
            if parent.tree_id() == tree_oid {
                return Ok(CommitOutcome::NothingToCommit);
            }

            let tree = repo.find_tree(tree_oid)?;
            let sig = Signature::now(&author_name, &author_email)?;
            let oid = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;
            Ok(CommitOutcome::Committed {
                sha: oid.to_string(),
                changes,
            })
        })
        .await
    }

    async fn push(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<PushReport, PushError> {
        validate_branch_name(branch)?;

        let attempts = push_with_retry(&self.retry, || {
            let dir = workdir.to_path_buf();
            let remote = remote.to_string();
            let branch = branch.to_string();
            let token = self.token.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    Self::push_once(&dir, &remote, &branch, token.as_deref())
                })
                .await
                .map_err(|e| {
                    PushAttemptError::Fatal(GitError::new("push", format!("task panicked: {e}")))
                })?
            }
        })
        .await?;

        Ok(PushReport {
            remote: remote.to_string(),
            branch: branch.to_string(),
            attempts,
        })
    }
}
