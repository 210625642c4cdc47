use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{ClaudeConfig, CrewConfig};
use crate::crew::claude::{ClaudeClient, MessageApi};
use crate::crew::engine::{CrewEngine, EngineOutcome, TurnUsage};
use crate::crew::prompt::{self, FILES_MARKER, VERDICT_MARKER};
use crate::crew::tools::ToolRegistry;
use crate::crew::{CrewInvoker, CrewKind, CrewOutput, CrewRequest};
use crate::error::CrewError;
use crate::workspace::GitOps;

/// Default crew backend: one Claude tool loop per invocation.
pub struct ClaudeCrew {
    api: Option<Arc<dyn MessageApi>>,
    claude: ClaudeConfig,
    crew: CrewConfig,
    git: Arc<dyn GitOps>,
}

impl ClaudeCrew {
    pub fn new(claude: ClaudeConfig, crew: CrewConfig, git: Arc<dyn GitOps>) -> Self {
        let api = claude
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| Arc::new(ClaudeClient::new(k)) as Arc<dyn MessageApi>);
        Self {
            api,
            claude,
            crew,
            git,
        }
    }

    pub fn with_api(
        api: Arc<dyn MessageApi>,
        claude: ClaudeConfig,
        crew: CrewConfig,
        git: Arc<dyn GitOps>,
    ) -> Self {
        Self {
            api: Some(api),
            claude,
            crew,
            git,
        }
    }

    fn model_for(&self, kind: CrewKind, fast_mode: bool) -> &str {
        match kind {
            CrewKind::Research => &self.claude.fast_model,
            CrewKind::Implementation if fast_mode => &self.claude.fast_model,
            _ => &self.claude.model,
        }
    }
}

fn trace(model: &str, usage: TurnUsage) -> serde_json::Value {
    json!({
        "model": model,
        "turns": usage.turns,
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
    })
}

/// Split a research report into findings and the trailing file list.
fn research_payload(text: &str) -> serde_json::Value {
    let files: Vec<String> = text
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(FILES_MARKER))
        .map(|list| {
            list.split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect()
        })
        .unwrap_or_default();
    json!({ "findings": text.trim(), "files_to_modify": files })
}

/// Read the verdict line a reviewer is asked to emit. NEEDS_CHANGES wins if
/// both appear.
pub fn parse_verdict(text: &str) -> Result<serde_json::Value, CrewError> {
    let verdicts: Vec<String> = text
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['*', '#', ' ']);
            line.strip_prefix(VERDICT_MARKER)
                .map(|v| v.trim().trim_matches('*').trim().to_uppercase())
        })
        .collect();

    let verdict = if verdicts.iter().any(|v| v.starts_with("NEEDS_CHANGES")) {
        "needs_changes"
    } else if verdicts.iter().any(|v| v.starts_with("PASS")) {
        "pass"
    } else {
        return Err(CrewError::InvalidOutput {
            kind: CrewKind::Review,
            message: "review did not contain a VERDICT line".to_string(),
        });
    };

    Ok(json!({ "verdict": verdict, "summary": text.trim() }))
}

#[async_trait]
impl CrewInvoker for ClaudeCrew {
    async fn invoke(&self, kind: CrewKind, request: CrewRequest) -> Result<CrewOutput, CrewError> {
        let api = self.api.clone().ok_or_else(|| CrewError::ProviderError {
            kind,
            message: "no Claude API key configured".to_string(),
        })?;

        let model = self.model_for(kind, request.fast_mode);
        let tools = ToolRegistry::for_crew(
            kind,
            &self.crew,
            self.git.clone(),
            request.repository_context.base_commit.clone(),
        );
        let engine = CrewEngine::new(api, tools, self.claude.max_turns, self.claude.max_tokens);

        let system = prompt::system_prompt(kind, &request.repository_context);
        let message = prompt::task_message(kind, &request);

        if request.verbose {
            tracing::info!(crew = %kind, model, "Starting crew");
        }

        let outcome = engine
            .run(
                model,
                &system,
                &request.repository_context.workspace_path,
                &message,
                request.deadline,
            )
            .await;

        match outcome {
            EngineOutcome::Completed { summary, usage } => {
                let payload = match kind {
                    CrewKind::Research => research_payload(&summary),
                    CrewKind::Implementation => json!({ "summary": summary.trim() }),
                    CrewKind::Review => parse_verdict(&summary)?,
                };
                Ok(CrewOutput::success(payload).with_trace(trace(model, usage)))
            }
            EngineOutcome::TurnLimitReached { usage } => Ok(CrewOutput::failure(format!(
                "{kind} crew reached the limit of {} turns without finishing",
                self.claude.max_turns
            ))
            .with_trace(trace(model, usage))),
            EngineOutcome::DeadlineReached { .. } => Err(CrewError::Timeout {
                kind,
                after: self.crew.timeout_for(kind),
            }),
            EngineOutcome::RateLimited { message } => Err(CrewError::ProviderError {
                kind,
                message: format!("rate limited: {message}"),
            }),
            EngineOutcome::Failed { error } => Err(CrewError::ProviderError {
                kind,
                message: error,
            }),
        }
    }
}
