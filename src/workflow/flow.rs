use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{AppConfig, ReviewPolicy, WorkspaceConfig};
use crate::crew::claude_crew::ClaudeCrew;
use crate::crew::schema::{self, ImplementationReport, ReviewVerdict};
use crate::crew::{
    BoundedInvoker, CrewInvoker, CrewKind, CrewOutput, CrewRequest, CrewStatus, CrewTimeouts,
    RepositoryContext,
};
use crate::workflow::observer::{JsonlObserver, StageEvent, StageObserver, TracingObserver};
use crate::workflow::types::{
    generated_branch_name, validate_task, CommitRecord, ReviewRecord, Stage, StageFailure,
    StageOutcome, StageRecord, StageResult, WorkflowError, WorkflowRequest, WorkflowResult,
    WorkflowState, WorkflowStatus,
};
use crate::workspace::{CommitOutcome, Git2Ops, GitOps, Workspace, WorkspaceManager};

const COMMIT_TITLE_CHARS: usize = 50;
const COMMIT_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub remote: String,
    pub branch_prefix: String,
    pub review_policy: ReviewPolicy,
    pub min_task_chars: usize,
    pub min_task_entropy: f64,
    /// Budget for each observer emission.
    pub observer_timeout: Duration,
}

impl FlowSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            remote: config.git.remote.clone(),
            branch_prefix: config.git.branch_prefix.clone(),
            review_policy: config.flow.review_policy,
            min_task_chars: config.flow.min_task_chars,
            min_task_entropy: config.flow.min_task_entropy,
            observer_timeout: Duration::from_millis(config.observability.emit_timeout_ms),
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What a stage produced besides its result.
struct StageReport {
    result: StageResult,
    detail: Option<String>,
    raw_trace: Option<serde_json::Value>,
}

impl StageReport {
    fn new(result: StageResult) -> Self {
        Self {
            result,
            detail: None,
            raw_trace: None,
        }
    }

    fn success() -> Self {
        Self::new(StageResult::Success(serde_json::Value::Null))
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn with_trace(mut self, trace: Option<serde_json::Value>) -> Self {
        self.raw_trace = trace;
        self
    }
}

struct StageClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StageClock {
    fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// The commit message the crew supplied, or one built from the task.
fn commit_message(issue: &str, report: &ImplementationReport) -> String {
    if let Some(message) = report
        .commit_message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        return message.to_string();
    }

    let title: String = issue
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(COMMIT_TITLE_CHARS)
        .collect();
    let summary: String = report.summary.chars().take(COMMIT_SUMMARY_CHARS).collect();
    format!("feat: {}\n\n{}\n\nChanges:\n{}\n", title.trim(), issue.trim(), summary.trim())
}

/// Drives one implementation run from workspace setup to push.
pub struct ImplementationFlow {
    git: Arc<dyn GitOps>,
    crews: Arc<dyn CrewInvoker>,
    observer: Arc<dyn StageObserver>,
    workspaces: WorkspaceManager,
    settings: FlowSettings,
    cancel: CancellationToken,
}

impl ImplementationFlow {
    pub fn new(
        git: Arc<dyn GitOps>,
        crews: Arc<dyn CrewInvoker>,
        observer: Arc<dyn StageObserver>,
        workspace: &WorkspaceConfig,
        settings: FlowSettings,
    ) -> Self {
        Self {
            workspaces: WorkspaceManager::new(git.clone(), workspace),
            git,
            crews,
            observer,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Build the flow with the default collaborators: libgit2, the Claude
    /// crew behind a deadline, and the configured observer.
    pub fn from_config(config: &AppConfig) -> Self {
        let git: Arc<dyn GitOps> = Arc::new(Git2Ops::new(&config.git));
        let backend = Arc::new(ClaudeCrew::new(
            config.claude.clone(),
            config.crew.clone(),
            git.clone(),
        ));
        let crews = Arc::new(BoundedInvoker::new(
            backend,
            CrewTimeouts::from_config(&config.crew),
        ));
        let observer: Arc<dyn StageObserver> = match &config.observability.events_file {
            Some(path) => Arc::new(JsonlObserver::new(path.clone())),
            None => Arc::new(TracingObserver),
        };

        Self::new(
            git,
            crews,
            observer,
            &config.workspace,
            FlowSettings::from_config(config),
        )
    }

    /// Cancelling this token stops the run at the next stage boundary,
    /// unless the push has already started.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self, request: WorkflowRequest) -> WorkflowResult {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(self, run_id: Uuid, request: WorkflowRequest) -> WorkflowResult {
        tracing::info!(
            repo = %request.repo_path.display(),
            worktree = request.use_worktree,
            auto_push = request.auto_push,
            fast = request.fast_mode,
            "Starting implementation run"
        );

        let mut state = WorkflowState::new(run_id);
        let mut workspace: Option<Workspace> = None;

        // A panicking collaborator must not skip the release below
        let driven = AssertUnwindSafe(self.drive(&request, &mut state, &mut workspace))
            .catch_unwind()
            .await;
        let status = match driven {
            Ok(status) => status,
            Err(panic) => self.abort(&mut state, panic_message(panic.as_ref())).await,
        };

        if let Some(ws) = workspace.as_mut() {
            self.workspaces.release(ws).await;
        }

        let result = state.into_result(status);
        self.emit("run result", self.observer.run_finished(&result)).await;
        tracing::info!(status = %result.final_status, "Implementation run finished");
        result
    }

    async fn drive(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        workspace: &mut Option<Workspace>,
    ) -> WorkflowStatus {
        let mut next = Stage::BranchSetup;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancel_at(state, next).await;
            }
            if !state.transition(next) {
                let failure = StageFailure::new(
                    "InvalidTransition",
                    format!("cannot move from {} to {next}", state.stage),
                );
                return self
                    .fail(state, next, StageClock::start(), failure, false, None)
                    .await;
            }
            if request.verbose {
                tracing::info!(stage = %next, "Entering stage");
            }

            let clock = StageClock::start();

            if request.fast_mode && matches!(next, Stage::Research | Stage::Review) {
                let detail = Some("fast mode".to_string());
                self.record(state, next, clock, StageOutcome::Skipped, detail, None).await;
            } else {
                let report = match next {
                    Stage::BranchSetup => self.branch_setup(request, state, workspace).await,
                    Stage::Research => self.research(request, state, workspace.as_ref()).await,
                    Stage::Implement => self.implement(request, state, workspace.as_ref()).await,
                    Stage::Review => self.review(request, state, workspace.as_ref()).await,
                    _ => self.push(state, workspace.as_ref()).await,
                };

                match report.result {
                    StageResult::Success(_) => {
                        self.record(
                            state,
                            next,
                            clock,
                            StageOutcome::Succeeded,
                            report.detail,
                            report.raw_trace,
                        )
                        .await;
                    }
                    StageResult::Retryable(failure) => {
                        return self
                            .fail(state, next, clock, failure, true, report.raw_trace)
                            .await;
                    }
                    StageResult::Fatal(failure) => {
                        return self
                            .fail(state, next, clock, failure, false, report.raw_trace)
                            .await;
                    }
                }
            }

            next = match next {
                Stage::BranchSetup => Stage::Research,
                Stage::Research => Stage::Implement,
                Stage::Implement => Stage::Review,
                Stage::Review => {
                    let committed = matches!(state.commit, CommitRecord::Committed { .. });
                    if request.auto_push && committed {
                        Stage::Push
                    } else {
                        Stage::Complete
                    }
                }
                _ => Stage::Complete,
            };

            if next == Stage::Complete {
                state.transition(Stage::Complete);
                return WorkflowStatus::Completed;
            }
        }
    }

    async fn branch_setup(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        workspace: &mut Option<Workspace>,
    ) -> StageReport {
        if request.skip_validation {
            tracing::warn!(
                event = "validation_skipped",
                chars = request.issue_description.chars().count(),
                "Task description accepted without validation"
            );
        } else if let Err(failure) = validate_task(
            &request.issue_description,
            self.settings.min_task_chars,
            self.settings.min_task_entropy,
        ) {
            return StageReport::new(StageResult::Fatal(failure));
        }

        let branch = match request.branch_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => generated_branch_name(&self.settings.branch_prefix, &request.issue_description),
        };
        state.branch_name = Some(branch.clone());

        match self
            .workspaces
            .acquire(&request.repo_path, &branch, request.use_worktree, state.run_id)
            .await
        {
            Ok(ws) => {
                let detail = format!("{} at {}", ws.branch, ws.path.display());
                state.workspace_path = Some(ws.path.clone());
                *workspace = Some(ws);
                StageReport::success().with_detail(detail)
            }
            Err(e) => {
                tracing::warn!(branch = %branch, error = %e, "Workspace setup failed");
                StageReport::new(e.into())
            }
        }
    }

    fn crew_request(
        &self,
        request: &WorkflowRequest,
        state: &WorkflowState,
        ws: &Workspace,
    ) -> CrewRequest {
        let mut prior = serde_json::Map::new();
        if let Some(research) = &state.research {
            prior.insert(Stage::Research.as_str().to_string(), research.clone());
        }
        if let Some(report) = &state.implementation {
            if let Ok(value) = serde_json::to_value(report) {
                prior.insert(Stage::Implement.as_str().to_string(), value);
            }
        }
        let commit = match &state.commit {
            CommitRecord::Committed { sha } => Some(serde_json::Value::from(sha.as_str())),
            CommitRecord::NoChanges => Some(serde_json::Value::Null),
            CommitRecord::NotAttempted => None,
        };
        if let Some(commit) = commit {
            let files = serde_json::to_value(&state.changes).unwrap_or_default();
            prior.insert(
                "changes".to_string(),
                serde_json::json!({ "commit": commit, "files": files }),
            );
        }

        CrewRequest {
            task_description: request.issue_description.clone(),
            repository_context: RepositoryContext {
                repo_path: ws.repo_path.clone(),
                workspace_path: ws.path.clone(),
                branch: ws.branch.clone(),
                base_commit: Some(ws.base_commit.clone()),
            },
            prior_stage_outputs: prior,
            fast_mode: request.fast_mode,
            verbose: request.verbose,
            deadline: None,
        }
    }

    /// Invoke a crew and turn a reported failure into a fatal stage result.
    async fn invoke_crew(
        &self,
        kind: CrewKind,
        crew_request: CrewRequest,
    ) -> Result<CrewOutput, StageReport> {
        match self.crews.invoke(kind, crew_request).await {
            Ok(output) if output.status == CrewStatus::Failure => {
                let reason = output.failure_reason();
                Err(StageReport::new(StageResult::fatal(
                    "CrewReportedFailure",
                    format!("{kind} crew reported failure: {reason}"),
                ))
                .with_trace(output.raw_trace))
            }
            Ok(output) => Ok(output),
            Err(e) => {
                tracing::warn!(crew = %kind, error = %e, "Crew invocation failed");
                Err(StageReport::new(e.into()))
            }
        }
    }

    async fn research(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        workspace: Option<&Workspace>,
    ) -> StageReport {
        let Some(ws) = workspace else {
            return missing_workspace();
        };
        let output = match self
            .invoke_crew(CrewKind::Research, self.crew_request(request, state, ws))
            .await
        {
            Ok(output) => output,
            Err(report) => return report,
        };

        if let Err(e) = schema::research(&output.payload) {
            return StageReport::new(e.into()).with_trace(output.raw_trace);
        }
        state.research = Some(output.payload);
        StageReport::success().with_trace(output.raw_trace)
    }

    async fn implement(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        workspace: Option<&Workspace>,
    ) -> StageReport {
        let Some(ws) = workspace else {
            return missing_workspace();
        };
        let output = match self
            .invoke_crew(CrewKind::Implementation, self.crew_request(request, state, ws))
            .await
        {
            Ok(output) => output,
            Err(report) => return report,
        };
        let trace = output.raw_trace;
        let report = match schema::implementation(&output.payload) {
            Ok(report) => report,
            Err(e) => return StageReport::new(e.into()).with_trace(trace),
        };

        let diff = match self.git.summarize_diff(&ws.path).await {
            Ok(diff) => diff,
            Err(e) => return StageReport::new(e.into()).with_trace(trace),
        };

        let detail = if diff.is_empty() {
            tracing::info!("Implementation produced no changes");
            state.commit = CommitRecord::NoChanges;
            "no changes".to_string()
        } else {
            let message = commit_message(&request.issue_description, &report);
            match self.git.commit_all(&ws.path, &message).await {
                Ok(CommitOutcome::Committed { sha, changes }) => {
                    tracing::info!(sha = %sha, files = changes.len(), "Committed changes");
                    let detail = format!("committed {} file(s) as {sha}", changes.len());
                    state.changes = changes;
                    state.commit = CommitRecord::Committed { sha };
                    detail
                }
                Ok(CommitOutcome::NothingToCommit) => {
                    tracing::info!("Nothing to commit after staging");
                    state.commit = CommitRecord::NoChanges;
                    "no changes".to_string()
                }
                Err(e) => return StageReport::new(e.into()).with_trace(trace),
            }
        };

        state.implementation = Some(report);
        StageReport::success().with_detail(detail).with_trace(trace)
    }

    async fn review(
        &self,
        request: &WorkflowRequest,
        state: &mut WorkflowState,
        workspace: Option<&Workspace>,
    ) -> StageReport {
        let Some(ws) = workspace else {
            return missing_workspace();
        };
        let output = match self
            .invoke_crew(CrewKind::Review, self.crew_request(request, state, ws))
            .await
        {
            Ok(output) => output,
            Err(report) => return report,
        };
        let trace = output.raw_trace;
        let report = match schema::review(&output.payload) {
            Ok(report) => report,
            Err(e) => return StageReport::new(e.into()).with_trace(trace),
        };

        let verdict = report.verdict;
        state.review = Some(ReviewRecord {
            verdict,
            summary: report.summary,
        });

        match (verdict, self.settings.review_policy) {
            (ReviewVerdict::NeedsChanges, ReviewPolicy::BlockOnNeedsChanges) => StageReport::new(
                StageResult::fatal("ReviewRejected", "review requested changes"),
            )
            .with_trace(trace),
            (ReviewVerdict::NeedsChanges, ReviewPolicy::Advisory) => {
                tracing::warn!("Review requested changes; continuing under advisory policy");
                StageReport::success()
                    .with_detail("needs_changes (advisory)")
                    .with_trace(trace)
            }
            (ReviewVerdict::Pass, _) => {
                StageReport::success().with_detail("pass").with_trace(trace)
            }
        }
    }

    async fn push(&self, state: &mut WorkflowState, workspace: Option<&Workspace>) -> StageReport {
        let Some(ws) = workspace else {
            return missing_workspace();
        };
        match self.git.push(&ws.path, &self.settings.remote, &ws.branch).await {
            Ok(report) => {
                state.pushed = true;
                StageReport::success().with_detail(format!(
                    "pushed to {}/{} after {} attempt(s)",
                    report.remote, report.branch, report.attempts
                ))
            }
            Err(e) => {
                tracing::error!(branch = %ws.branch, error = %e, "Push failed");
                StageReport::new(e.into())
            }
        }
    }

    async fn record(
        &self,
        state: &mut WorkflowState,
        stage: Stage,
        clock: StageClock,
        outcome: StageOutcome,
        detail: Option<String>,
        raw_trace: Option<serde_json::Value>,
    ) {
        let finished_at = Utc::now();
        state.stages.push(StageRecord {
            stage,
            started_at: clock.started_at,
            finished_at,
            outcome,
        });

        let event = StageEvent {
            run_id: state.run_id,
            stage,
            timestamp: finished_at,
            duration_ms: clock.started.elapsed().as_millis() as u64,
            status: outcome,
            detail,
            raw_trace,
        };
        self.emit("stage event", self.observer.stage_finished(&event)).await;
    }

    /// Await one observer call within the emission budget. Errors, panics
    /// and timeouts are logged and dropped.
    async fn emit<F>(&self, what: &'static str, call: F)
    where
        F: Future<Output = crate::error::Result<()>>,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        match tokio::time::timeout(self.settings.observer_timeout, guarded).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Failed to emit {what}"),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(error = %message, "Observer panicked emitting {what}");
            }
            Err(_) => tracing::warn!(
                timeout_ms = self.settings.observer_timeout.as_millis() as u64,
                "Dropped {what}: observer did not finish in time"
            ),
        }
    }

    async fn fail(
        &self,
        state: &mut WorkflowState,
        stage: Stage,
        clock: StageClock,
        failure: StageFailure,
        retryable: bool,
        raw_trace: Option<serde_json::Value>,
    ) -> WorkflowStatus {
        tracing::error!(
            stage = %stage,
            kind = %failure.kind,
            error = %failure.message,
            retryable,
            "Stage failed"
        );
        self.record(
            state,
            stage,
            clock,
            StageOutcome::Failed,
            Some(format!("{}: {}", failure.kind, failure.message)),
            raw_trace,
        )
        .await;
        state.error = Some(WorkflowError {
            stage,
            kind: failure.kind,
            message: failure.message,
            retryable,
        });
        state.transition(Stage::Failed);
        WorkflowStatus::Failed
    }

    /// Fail the run at its current stage after a collaborator panicked.
    async fn abort(&self, state: &mut WorkflowState, message: String) -> WorkflowStatus {
        let stage = state.stage;
        match stage {
            Stage::Complete => return WorkflowStatus::Completed,
            Stage::Cancelled => return WorkflowStatus::Cancelled,
            Stage::Failed => return WorkflowStatus::Failed,
            _ => {}
        }
        let failure = StageFailure::new("Panic", message);
        self.fail(state, stage, StageClock::start(), failure, false, None).await
    }

    async fn cancel_at(&self, state: &mut WorkflowState, stage: Stage) -> WorkflowStatus {
        tracing::info!(stage = %stage, "Run cancelled before stage");
        self.record(
            state,
            stage,
            StageClock::start(),
            StageOutcome::Cancelled,
            Some("cancelled before start".to_string()),
            None,
        )
        .await;
        state.transition(Stage::Cancelled);
        WorkflowStatus::Cancelled
    }
}

fn missing_workspace() -> StageReport {
    StageReport::new(StageResult::fatal(
        "WorkspaceMissing",
        "no workspace was acquired for this run",
    ))
}

/// Run one implementation with the default collaborators built from
/// `config`.
pub async fn run_implementation(config: &AppConfig, request: WorkflowRequest) -> WorkflowResult {
    ImplementationFlow::from_config(config).run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::{ClaudeConfig, CrewConfig, GitConfig};
    use crate::crew::claude::{ContentBlock, MessageContent};
    use crate::crew::engine::tests::{text_response, tool_response, ScriptedApi};
    use crate::error::{CrewError, PushError};
    use crate::workflow::fakes::{
        FailingObserver, FakeCrews, FakeGit, PanickingObserver, RecordingObserver,
        StalledObserver, BASE_COMMIT,
    };
    use crate::workflow::observer::NullObserver;
    use crate::workspace::git::tests::init_repo;
    use crate::workspace::git::BranchState;
    use crate::workspace::{ChangeKind, FileChange};

    struct Harness {
        _tmp: tempfile::TempDir,
        repo: std::path::PathBuf,
        worktree_root: std::path::PathBuf,
        git: Arc<FakeGit>,
        crews: Arc<FakeCrews>,
        observer: Arc<RecordingObserver>,
        policy: ReviewPolicy,
    }

    impl Harness {
        fn new(git: FakeGit) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let repo = tmp.path().join("app");
            std::fs::create_dir_all(repo.join(".git")).unwrap();
            let worktree_root = tmp.path().join("worktrees");
            Self {
                repo,
                worktree_root,
                _tmp: tmp,
                git: Arc::new(git),
                crews: Arc::new(FakeCrews::default()),
                observer: Arc::new(RecordingObserver::default()),
                policy: ReviewPolicy::Advisory,
            }
        }

        fn flow(&self) -> ImplementationFlow {
            self.flow_with_observer(self.observer.clone())
        }

        fn flow_with_observer(&self, observer: Arc<dyn StageObserver>) -> ImplementationFlow {
            ImplementationFlow::new(
                self.git.clone(),
                self.crews.clone(),
                observer,
                &WorkspaceConfig {
                    worktree_root: Some(self.worktree_root.clone()),
                },
                FlowSettings {
                    remote: "origin".to_string(),
                    branch_prefix: "shepherd/".to_string(),
                    review_policy: self.policy,
                    observer_timeout: Duration::from_millis(50),
                    ..FlowSettings::default()
                },
            )
        }

        fn request(&self) -> WorkflowRequest {
            WorkflowRequest::new(&self.repo, "Add a health check endpoint")
        }

        fn worktree_dirs(&self) -> usize {
            std::fs::read_dir(&self.worktree_root)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    fn one_change() -> Vec<FileChange> {
        vec![FileChange {
            path: "src/health.rs".to_string(),
            kind: ChangeKind::Added,
        }]
    }

    #[tokio::test]
    async fn test_worktree_run_completes_and_cleans_up() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let mut request = h.request();
        request.use_worktree = true;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert_eq!(result.changes_made, one_change());
        assert_eq!(
            result.commit,
            CommitRecord::Committed {
                sha: "c0ffee".to_string()
            }
        );
        assert!(result.pushed);
        assert_eq!(result.branch_name.as_deref(), Some("shepherd/add-a-health-check-endpoint"));
        assert_eq!(result.review.as_ref().map(|r| r.verdict), Some(ReviewVerdict::Pass));
        assert!(result.error.is_none());

        assert_eq!(h.git.worktrees_added.load(Ordering::SeqCst), 1);
        assert_eq!(h.git.worktrees_removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.worktree_dirs(), 0);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(h.crews.total_calls(), 3);
        assert_eq!(result.stage_outcome(Stage::Push), Some(StageOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_empty_diff_completes_without_commit_or_push() {
        let h = Harness::new(FakeGit::default());
        let result = h.flow().run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(result.changes_made.is_empty());
        assert_eq!(result.commit, CommitRecord::NoChanges);
        assert!(!result.pushed);
        assert_eq!(h.git.commits(), 0);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 0);
        assert_eq!(result.stage_outcome(Stage::Push), None);
    }

    #[tokio::test]
    async fn test_auto_push_disabled_keeps_local_commit() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let mut request = h.request();
        request.auto_push = false;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(matches!(result.commit, CommitRecord::Committed { .. }));
        assert!(!result.pushed);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 0);
        assert!(result.stages.iter().all(|r| r.stage != Stage::Push));
    }

    #[tokio::test]
    async fn test_rejected_push_fails_and_keeps_commit() {
        let git = FakeGit::with_diff(one_change());
        *git.push_result.lock().unwrap() = Err(PushError::Rejected {
            reason: "non-fast-forward".to_string(),
        });
        let h = Harness::new(git);

        let result = h.flow().run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "PushError::Rejected");
        assert_eq!(error.stage, Stage::Push);
        assert!(!error.retryable);
        assert!(matches!(result.commit, CommitRecord::Committed { .. }));
        assert!(!result.pushed);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_push_failure_is_retryable() {
        let git = FakeGit::with_diff(one_change());
        *git.push_result.lock().unwrap() = Err(PushError::Transient {
            attempts: 4,
            reason: "connection reset".to_string(),
        });
        let h = Harness::new(git);

        let result = h.flow().run(h.request()).await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, "PushError::Transient");
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_workspace_error_invokes_no_crew() {
        let git = FakeGit::default();
        *git.dirty.lock().unwrap() = true;
        let h = Harness::new(git);

        let result = h.flow().run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.stage, Stage::BranchSetup);
        assert_eq!(error.kind, "WorkspaceError::DirtyTree");
        assert_eq!(h.crews.total_calls(), 0);
        assert!(result.workspace_path.is_none());
    }

    #[tokio::test]
    async fn test_existing_branch_blocks_worktree() {
        let git = FakeGit::default();
        *git.branch_state.lock().unwrap() = BranchState::Diverged;
        let h = Harness::new(git);
        let mut request = h.request();
        request.use_worktree = true;
        request.branch_name = Some("feature/taken".to_string());

        let result = h.flow().run(request).await;

        assert_eq!(result.error.unwrap().kind, "WorkspaceError::BranchExists");
        assert_eq!(h.git.worktrees_added.load(Ordering::SeqCst), 0);
        assert_eq!(h.git.worktrees_removed.load(Ordering::SeqCst), 0);
        assert_eq!(h.crews.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_repository() {
        let h = Harness::new(FakeGit::default());
        let request = WorkflowRequest::new(h.repo.join("nope"), "Add a health check endpoint");

        let result = h.flow().run(request).await;
        assert_eq!(result.error.unwrap().kind, "WorkspaceError::InvalidRepository");
    }

    #[tokio::test]
    async fn test_cancellation_during_research() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let flow = h.flow();
        *h.crews.cancel_during.lock().unwrap() =
            Some((CrewKind::Research, flow.cancellation_token()));
        let mut request = h.request();
        request.use_worktree = true;

        let result = flow.run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Cancelled);
        assert_eq!(result.commit, CommitRecord::NotAttempted);
        assert_eq!(h.git.commits(), 0);
        assert_eq!(h.crews.calls_for(CrewKind::Implementation), 0);
        assert_eq!(h.git.worktrees_removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.worktree_dirs(), 0);
        assert_eq!(result.stage_outcome(Stage::Research), Some(StageOutcome::Succeeded));
        assert_eq!(result.stage_outcome(Stage::Implement), Some(StageOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_is_checked_at_the_push_boundary() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let flow = h.flow();
        *h.crews.cancel_during.lock().unwrap() =
            Some((CrewKind::Review, flow.cancellation_token()));

        let result = flow.run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Cancelled);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 0);
        assert!(!Stage::Push.can_transition_to(Stage::Cancelled));
    }

    #[tokio::test]
    async fn test_fast_mode_skips_research_and_review() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let mut request = h.request();
        request.fast_mode = true;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert_eq!(h.crews.calls_for(CrewKind::Research), 0);
        assert_eq!(h.crews.calls_for(CrewKind::Review), 0);
        assert_eq!(h.crews.calls_for(CrewKind::Implementation), 1);
        assert_eq!(result.stage_outcome(Stage::Research), Some(StageOutcome::Skipped));
        assert_eq!(result.stage_outcome(Stage::Review), Some(StageOutcome::Skipped));
        assert!(result.review.is_none());

        let requests = h.crews.requests.lock().unwrap();
        assert!(requests[0].fast_mode);
        assert!(requests[0].prior("research").is_none());
    }

    #[tokio::test]
    async fn test_blocking_review_policy_stops_before_push() {
        let mut h = Harness::new(FakeGit::with_diff(one_change()));
        h.policy = ReviewPolicy::BlockOnNeedsChanges;
        h.crews.script(
            CrewKind::Review,
            Ok(CrewOutput::success(
                json!({"verdict": "needs_changes", "summary": "no tests"}),
            )),
        );

        let result = h.flow().run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "ReviewRejected");
        assert_eq!(error.stage, Stage::Review);
        assert_eq!(h.git.pushes.load(Ordering::SeqCst), 0);
        assert!(matches!(result.commit, CommitRecord::Committed { .. }));
        assert_eq!(
            result.review.as_ref().map(|r| r.verdict),
            Some(ReviewVerdict::NeedsChanges)
        );
    }

    #[tokio::test]
    async fn test_advisory_review_still_pushes() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        h.crews.script(
            CrewKind::Review,
            Ok(CrewOutput::success(json!({"verdict": "needs_changes"}))),
        );

        let result = h.flow().run(h.request()).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(result.pushed);
    }

    #[tokio::test]
    async fn test_crew_errors_map_to_failed_results() {
        let h = Harness::new(FakeGit::default());
        h.crews.script(
            CrewKind::Research,
            Err(CrewError::Timeout {
                kind: CrewKind::Research,
                after: Duration::from_secs(600),
            }),
        );
        let result = h.flow().run(h.request()).await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, "CrewError::Timeout");
        assert_eq!(error.stage, Stage::Research);
        assert!(error.retryable);

        let h = Harness::new(FakeGit::default());
        h.crews.script(
            CrewKind::Implementation,
            Ok(CrewOutput::failure("could not find the router")),
        );
        let result = h.flow().run(h.request()).await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, "CrewReportedFailure");
        assert!(error.message.contains("could not find the router"));
        assert!(!error.retryable);
        assert_eq!(h.git.commits(), 0);

        let h = Harness::new(FakeGit::default());
        h.crews.script(
            CrewKind::Implementation,
            Ok(CrewOutput::success(json!({"notes": "wrong shape"}))),
        );
        let result = h.flow().run(h.request()).await;
        assert_eq!(result.error.unwrap().kind, "CrewError::InvalidOutput");
    }

    #[tokio::test]
    async fn test_implementation_receives_research_findings() {
        let h = Harness::new(FakeGit::default());
        h.flow().run(h.request()).await;

        let requests = h.crews.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests[1].prior("research").unwrap()["findings"],
            "edit src/lib.rs"
        );
        assert_eq!(
            requests[2].prior("implement").unwrap()["summary"],
            "updated src/lib.rs"
        );
        assert!(requests[1].prior("changes").is_none());
        assert_eq!(requests[2].prior("changes").unwrap()["commit"], json!(null));
        assert!(requests
            .iter()
            .all(|r| r.repository_context.base_commit.as_deref() == Some(BASE_COMMIT)));
    }

    #[tokio::test]
    async fn test_review_request_carries_the_commit() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        h.flow().run(h.request()).await;

        let requests = h.crews.requests.lock().unwrap();
        let changes = requests[2].prior("changes").unwrap();
        assert_eq!(changes["commit"], "c0ffee");
        assert_eq!(changes["files"][0]["path"], "src/health.rs");
        assert_eq!(changes["files"][0]["kind"], "added");
    }

    #[tokio::test]
    async fn test_review_sees_the_committed_change() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("app");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let api = Arc::new(ScriptedApi::new(vec![
            text_response("A single README.\nFILES: new.rs"),
            tool_response("write_file", json!({"path": "new.rs", "content": "fn main() {}\n"})),
            text_response("Added new.rs"),
            tool_response("changed_files", json!({})),
            text_response("VERDICT: PASS\nnew.rs looks fine"),
        ]));
        let git: Arc<dyn GitOps> = Arc::new(Git2Ops::new(&GitConfig::default()));
        let crews = Arc::new(ClaudeCrew::with_api(
            api.clone(),
            ClaudeConfig::default(),
            CrewConfig::default(),
            git.clone(),
        ));
        let flow = ImplementationFlow::new(
            git,
            crews,
            Arc::new(NullObserver),
            &WorkspaceConfig::default(),
            FlowSettings::default(),
        );
        let mut request = WorkflowRequest::new(&repo, "Add a new.rs entry point");
        request.auto_push = false;

        let result = flow.run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert_eq!(
            result.changes_made,
            vec![FileChange {
                path: "new.rs".to_string(),
                kind: ChangeKind::Added,
            }]
        );
        assert_eq!(result.review.as_ref().map(|r| r.verdict), Some(ReviewVerdict::Pass));

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 5);
        let MessageContent::Text(review_task) = &requests[3].messages[0].content else {
            panic!("expected the review task as text");
        };
        assert!(review_task.contains("- new.rs (added)"));
        let MessageContent::Blocks(blocks) = &requests[4].messages[2].content else {
            panic!("expected tool result blocks");
        };
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { content, .. } if content == "new.rs (added)"
        ));
    }

    #[tokio::test]
    async fn test_commit_message_prefers_crew_message() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        h.crews.script(
            CrewKind::Implementation,
            Ok(CrewOutput::success(
                json!({"summary": "added /health", "commit_message": "feat: add /health"}),
            )),
        );
        h.flow().run(h.request()).await;
        assert_eq!(h.git.commit_messages.lock().unwrap()[0], "feat: add /health");
    }

    #[test]
    fn test_generated_commit_message() {
        let report = ImplementationReport {
            summary: "x".repeat(600),
            commit_message: None,
        };
        let message = commit_message("Add a health check endpoint\nwith details", &report);
        assert!(message.starts_with("feat: Add a health check endpoint\n\n"));
        assert!(message.contains("Changes:\n"));
        let changes = message.split("Changes:\n").nth(1).unwrap();
        assert_eq!(changes.trim().len(), 500);
    }

    #[tokio::test]
    async fn test_observer_sees_every_stage_and_the_result() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let result = h.flow().run(h.request()).await;

        let events = h.observer.events.lock().unwrap();
        let stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::BranchSetup,
                Stage::Research,
                Stage::Implement,
                Stage::Review,
                Stage::Push
            ]
        );
        assert!(events.iter().all(|e| e.run_id == result.run_id));
        assert_eq!(h.observer.finished.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_observer_failures_do_not_change_the_result() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let result = h.flow_with_observer(Arc::new(FailingObserver)).run(h.request()).await;
        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(result.pushed);
    }

    #[tokio::test]
    async fn test_stalled_observer_does_not_hold_up_the_run() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let flow = h.flow_with_observer(Arc::new(StalledObserver));

        let result = tokio::time::timeout(Duration::from_secs(5), flow.run(h.request()))
            .await
            .expect("run waited on the observer");

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(result.pushed);
        assert_eq!(result.stages.len(), 5);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_change_the_result() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        let result = h
            .flow_with_observer(Arc::new(PanickingObserver))
            .run(h.request())
            .await;
        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert!(result.pushed);
    }

    #[tokio::test]
    async fn test_panicking_crew_fails_the_run_and_releases_the_worktree() {
        let h = Harness::new(FakeGit::with_diff(one_change()));
        *h.crews.panic_on.lock().unwrap() = Some(CrewKind::Research);
        let mut request = h.request();
        request.use_worktree = true;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Failed);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "Panic");
        assert_eq!(error.stage, Stage::Research);
        assert!(error.message.contains("research crew blew up"));
        assert!(!error.retryable);
        assert_eq!(result.stage_outcome(Stage::Research), Some(StageOutcome::Failed));

        assert_eq!(h.git.worktrees_removed.load(Ordering::SeqCst), 1);
        assert_eq!(h.worktree_dirs(), 0);
        assert_eq!(h.crews.calls_for(CrewKind::Implementation), 0);
        assert_eq!(h.observer.finished.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_task_is_rejected_before_setup() {
        let h = Harness::new(FakeGit::default());

        for task in ["gdgd", "gdgdgdgdgdgdgdgdgdgdgd"] {
            let result = h.flow().run(WorkflowRequest::new(&h.repo, task)).await;
            assert_eq!(result.final_status, WorkflowStatus::Failed);
            let error = result.error.unwrap();
            assert_eq!(error.kind, "InvalidRequest");
            assert_eq!(error.stage, Stage::BranchSetup);
            assert!(!error.retryable);
            assert!(result.workspace_path.is_none());
        }
        assert_eq!(h.git.branches_created.load(Ordering::SeqCst), 0);
        assert_eq!(h.crews.total_calls(), 0);

        let result = h
            .flow()
            .run(WorkflowRequest::new(&h.repo, "Add dark mode to the settings panel"))
            .await;
        assert_eq!(result.final_status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_skip_validation_accepts_any_task() {
        let h = Harness::new(FakeGit::default());
        let mut request = WorkflowRequest::new(&h.repo, "gdgd");
        request.skip_validation = true;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Completed);
        assert_eq!(result.branch_name.as_deref(), Some("shepherd/gdgd"));
    }

    #[tokio::test]
    async fn test_run_implementation_wires_the_configured_collaborators() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("app");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);
        let events = tmp.path().join("events.jsonl");

        let mut config = AppConfig::default();
        config.observability.events_file = Some(events.clone());
        let request = WorkflowRequest::new(&repo, "Add a health check endpoint");

        // No API key: the default crew reports a provider error at research
        let result = run_implementation(&config, request).await;

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "CrewError::ProviderError");
        assert_eq!(error.stage, Stage::Research);
        assert!(error.retryable);
        assert_eq!(
            result.branch_name.as_deref(),
            Some("shepherd/add-a-health-check-endpoint")
        );

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&events)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["stage"], "branch_setup");
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[2]["event"], "run_finished");
    }

    #[tokio::test]
    async fn test_release_happens_exactly_once_on_failure() {
        let git = FakeGit::with_diff(one_change());
        *git.push_result.lock().unwrap() = Err(PushError::Rejected {
            reason: "protected".to_string(),
        });
        let h = Harness::new(git);
        let mut request = h.request();
        request.use_worktree = true;

        let result = h.flow().run(request).await;

        assert_eq!(result.final_status, WorkflowStatus::Failed);
        assert_eq!(h.git.worktrees_added.load(Ordering::SeqCst), 1);
        assert_eq!(h.git.worktrees_removed.load(Ordering::SeqCst), 1);
        assert!(!result.workspace_path.unwrap().exists());
    }
}
