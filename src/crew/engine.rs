use std::path::Path;
use std::sync::Arc;

use tokio::time::Instant;

use crate::crew::claude::{ContentBlock, Message, MessageApi, MessageContent, MessagesRequest};
use crate::crew::tools::{ToolOutput, ToolRegistry};
use crate::error::AppError;

/// Outcome of one tool-using conversation.
#[derive(Debug)]
pub enum EngineOutcome {
    /// The model ended its turn; `summary` is its final text.
    Completed { summary: String, usage: TurnUsage },
    TurnLimitReached { usage: TurnUsage },
    /// The deadline passed before another turn could start.
    DeadlineReached { usage: TurnUsage },
    RateLimited { message: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnUsage {
    pub turns: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub struct CrewEngine {
    api: Arc<dyn MessageApi>,
    tools: ToolRegistry,
    max_turns: u32,
    max_tokens: u32,
}

impl CrewEngine {
    pub fn new(
        api: Arc<dyn MessageApi>,
        tools: ToolRegistry,
        max_turns: u32,
        max_tokens: u32,
    ) -> Self {
        Self {
            api,
            tools,
            max_turns,
            max_tokens,
        }
    }

    /// Run the tool loop until the model ends its turn or a limit is hit.
    /// The deadline is checked before every turn.
    pub async fn run(
        &self,
        model: &str,
        system_prompt: &str,
        workspace_root: &Path,
        initial_message: &str,
        deadline: Option<Instant>,
    ) -> EngineOutcome {
        let tool_definitions = self.tools.definitions();
        let mut messages = vec![Message::user_text(initial_message)];
        let mut usage = TurnUsage::default();

        for turn in 0..self.max_turns {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(turn, "Crew deadline reached");
                return EngineOutcome::DeadlineReached { usage };
            }

            tracing::debug!(turn, model, "Crew turn");

            let request = MessagesRequest {
                model: model.to_string(),
                max_tokens: self.max_tokens,
                system: system_prompt.to_string(),
                messages: messages.clone(),
                tools: tool_definitions.clone(),
            };

            let response = match self.api.send_message(&request).await {
                Ok(r) => r,
                Err(AppError::ClaudeRateLimited(message)) => {
                    tracing::warn!("Claude API rate limited, stopping crew");
                    return EngineOutcome::RateLimited { message };
                }
                Err(e) => {
                    return EngineOutcome::Failed {
                        error: format!("Claude API error: {e}"),
                    };
                }
            };

            usage.turns = turn + 1;
            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;

            tracing::debug!(
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                stop_reason = ?response.stop_reason,
                "Claude response"
            );

            match response.stop_reason.as_deref().unwrap_or("unknown") {
                "end_turn" => {
                    tracing::info!(
                        turns = usage.turns,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Crew completed"
                    );
                    return EngineOutcome::Completed {
                        summary: extract_text(&response.content),
                        usage,
                    };
                }
                "tool_use" => {
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Blocks(response.content.clone()),
                    });

                    let mut tool_results = Vec::new();
                    for block in &response.content {
                        if let ContentBlock::ToolUse { id, name, input } = block {
                            tool_results.push(self.run_tool(workspace_root, id, name, input).await);
                        }
                    }

                    messages.push(Message {
                        role: "user".to_string(),
                        content: MessageContent::Blocks(tool_results),
                    });
                }
                "max_tokens" => {
                    tracing::warn!("Crew response hit max_tokens limit");
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Blocks(response.content),
                    });
                    messages.push(Message::user_text("Please continue."));
                }
                other => {
                    tracing::warn!(stop_reason = other, "Unexpected stop reason");
                    return EngineOutcome::Failed {
                        error: format!("Unexpected stop reason: {other}"),
                    };
                }
            }
        }

        tracing::warn!(max_turns = self.max_turns, "Crew hit turn limit");
        EngineOutcome::TurnLimitReached { usage }
    }

    async fn run_tool(
        &self,
        workspace_root: &Path,
        id: &str,
        name: &str,
        input: &serde_json::Value,
    ) -> ContentBlock {
        tracing::debug!(tool = %name, "Executing tool");

        let result = match self.tools.get(name) {
            Some(tool) => tool.execute(workspace_root, input.clone()).await,
            None => Ok(ToolOutput::Error(format!("Unknown tool: {name}"))),
        };

        let (content, is_error) = match result {
            Ok(ToolOutput::Success(content)) => (content, None),
            Ok(ToolOutput::Error(error)) => {
                tracing::debug!(tool = %name, error = %error, "Tool error");
                (error, Some(true))
            }
            Err(e) => {
                tracing::error!(tool = %name, error = %e, "Tool execution error");
                (format!("Internal error: {e}"), Some(true))
            }
        };

        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content,
            is_error,
        }
    }
}

fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
