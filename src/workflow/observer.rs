//! Best-effort emission of stage transitions and run completion.
//!
//! Observers never influence a run: the orchestrator logs emission errors
//! at `warn` and carries on.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::workflow::types::{Stage, StageOutcome, WorkflowResult};

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub run_id: Uuid,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Crew execution trace, when the stage invoked a crew.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_trace: Option<serde_json::Value>,
}

#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn stage_finished(&self, event: &StageEvent) -> Result<()>;

    async fn run_finished(&self, result: &WorkflowResult) -> Result<()>;
}

/// Emits structured `tracing` events. The default observer.
pub struct TracingObserver;

#[async_trait]
impl StageObserver for TracingObserver {
    async fn stage_finished(&self, event: &StageEvent) -> Result<()> {
        tracing::info!(
            event = "stage.finished",
            run_id = %event.run_id,
            stage = %event.stage,
            status = event.status.as_str(),
            duration_ms = event.duration_ms,
            detail = event.detail.as_deref().unwrap_or(""),
        );
        if let Some(trace) = &event.raw_trace {
            tracing::debug!(
                run_id = %event.run_id,
                stage = %event.stage,
                trace = %trace,
                "Crew trace"
            );
        }
        Ok(())
    }

    async fn run_finished(&self, result: &WorkflowResult) -> Result<()> {
        let duration_ms = (result.finished_at - result.started_at).num_milliseconds();
        tracing::info!(
            event = "run.finished",
            run_id = %result.run_id,
            status = %result.final_status,
            duration_ms,
            changes = result.changes_made.len(),
            pushed = result.pushed,
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonlRecord<'a> {
    Stage(&'a StageEvent),
    RunFinished { result: &'a WorkflowResult },
}

impl JsonlObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &JsonlRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                AppError::Observability(format!(
                    "Failed to open {}: {e}",
                    self.path.display()
                ))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StageObserver for JsonlObserver {
    async fn stage_finished(&self, event: &StageEvent) -> Result<()> {
        self.append(&JsonlRecord::Stage(event)).await
    }

    async fn run_finished(&self, result: &WorkflowResult) -> Result<()> {
        self.append(&JsonlRecord::RunFinished { result }).await
    }
}

pub struct NullObserver;

#[async_trait]
impl StageObserver for NullObserver {
    async fn stage_finished(&self, _event: &StageEvent) -> Result<()> {
        Ok(())
    }

    async fn run_finished(&self, _result: &WorkflowResult) -> Result<()> {
        Ok(())
    }
}
