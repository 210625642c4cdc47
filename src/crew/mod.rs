pub mod claude;
pub mod claude_crew;
pub mod engine;
pub mod prompt;
pub mod schema;
pub mod tools;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CrewConfig;
use crate::error::CrewError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrewKind {
    Research,
    Implementation,
    Review,
}

impl CrewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrewKind::Research => "research",
            CrewKind::Implementation => "implementation",
            CrewKind::Review => "review",
        }
    }
}

impl fmt::Display for CrewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the crew is allowed to look and write.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryContext {
    pub repo_path: PathBuf,
    pub workspace_path: PathBuf,
    pub branch: String,
    /// Commit the branch started from, when known.
    pub base_commit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CrewRequest {
    pub task_description: String,
    pub repository_context: RepositoryContext,
    /// Outputs of earlier stages keyed by stage name.
    pub prior_stage_outputs: serde_json::Map<String, serde_json::Value>,
    pub fast_mode: bool,
    pub verbose: bool,
    /// Set by the invoker; backends should stop taking new turns past it.
    pub deadline: Option<Instant>,
}

impl CrewRequest {
    pub fn prior(&self, stage: &str) -> Option<&serde_json::Value> {
        self.prior_stage_outputs.get(stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrewStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct CrewOutput {
    pub status: CrewStatus,
    /// Stage-specific payload; see `schema` for the success shapes.
    pub payload: serde_json::Value,
    /// Opaque execution trace, forwarded to observability only.
    pub raw_trace: Option<serde_json::Value>,
}

impl CrewOutput {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            status: CrewStatus::Success,
            payload,
            raw_trace: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: CrewStatus::Failure,
            payload: serde_json::json!({ "reason": reason.into() }),
            raw_trace: None,
        }
    }

    pub fn with_trace(mut self, trace: serde_json::Value) -> Self {
        self.raw_trace = Some(trace);
        self
    }

    /// Human-readable reason carried by a failure payload.
    pub fn failure_reason(&self) -> String {
        self.payload
            .get("reason")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.payload.to_string())
    }
}

/// The boundary to whatever performs AI-driven work.
#[async_trait]
pub trait CrewInvoker: Send + Sync {
    async fn invoke(&self, kind: CrewKind, request: CrewRequest) -> Result<CrewOutput, CrewError>;
}

#[derive(Debug, Clone)]
pub struct CrewTimeouts {
    pub research: Duration,
    pub implementation: Duration,
    pub review: Duration,
    pub grace: Duration,
}

impl CrewTimeouts {
    pub fn from_config(config: &CrewConfig) -> Self {
        Self {
            research: config.timeout_for(CrewKind::Research),
            implementation: config.timeout_for(CrewKind::Implementation),
            review: config.timeout_for(CrewKind::Review),
            grace: Duration::from_secs(config.timeout_grace_secs),
        }
    }

    pub fn for_kind(&self, kind: CrewKind) -> Duration {
        match kind {
            CrewKind::Research => self.research,
            CrewKind::Implementation => self.implementation,
            CrewKind::Review => self.review,
        }
    }
}

/// Wraps a backend with a per-invocation deadline and payload validation,
/// so every failure reaching the workflow is one of the `CrewError` kinds.
pub struct BoundedInvoker {
    inner: Arc<dyn CrewInvoker>,
    timeouts: CrewTimeouts,
}

impl BoundedInvoker {
    pub fn new(inner: Arc<dyn CrewInvoker>, timeouts: CrewTimeouts) -> Self {
        Self { inner, timeouts }
    }
}

#[async_trait]
impl CrewInvoker for BoundedInvoker {
    async fn invoke(
        &self,
        kind: CrewKind,
        mut request: CrewRequest,
    ) -> Result<CrewOutput, CrewError> {
        let budget = self.timeouts.for_kind(kind);
        let deadline = Instant::now() + budget;
        request.deadline = Some(deadline);

        tracing::debug!(crew = %kind, timeout_secs = budget.as_secs(), "Invoking crew");

        // Backends check the deadline between turns; the grace period covers
        // the turn in flight before the call is abandoned outright.
        let hard_stop = deadline + self.timeouts.grace;
        let call = self.inner.invoke(kind, request);
        let output = match tokio::time::timeout_at(hard_stop, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CrewError::Timeout {
                    kind,
                    after: budget,
                })
            }
        };

        if output.status == CrewStatus::Success {
            schema::validate(kind, &output.payload)?;
        }
        Ok(output)
    }
}
