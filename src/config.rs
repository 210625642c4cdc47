use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crew::CrewKind;
use crate::error::{AppError, Result};

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub claude: ClaudeConfig,
    pub crew: CrewConfig,
    pub git: GitConfig,
    pub workspace: WorkspaceConfig,
    pub flow: FlowConfig,
    pub log: LogConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ClaudeConfig {
    pub api_key: Option<String>,
    pub model: String,
    /// Used for research and for implementation in fast mode.
    pub fast_model: String,
    pub max_tokens: u32,
    pub max_turns: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            fast_model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 16384,
            max_turns: 50,
        }
    }
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for ClaudeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("model", &self.model)
            .field("fast_model", &self.fast_model)
            .field("max_tokens", &self.max_tokens)
            .field("max_turns", &self.max_turns)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CrewConfig {
    pub research_timeout_secs: u64,
    pub implementation_timeout_secs: u64,
    pub review_timeout_secs: u64,
    /// Extra time granted past the deadline before the invocation is abandoned.
    pub timeout_grace_secs: u64,
    pub max_file_size_bytes: usize,
    pub max_search_results: usize,
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            research_timeout_secs: 600,
            implementation_timeout_secs: 600,
            review_timeout_secs: 600,
            timeout_grace_secs: 30,
            max_file_size_bytes: 512 * 1024,
            max_search_results: 50,
        }
    }
}

impl CrewConfig {
    pub fn timeout_for(&self, kind: CrewKind) -> Duration {
        let secs = match kind {
            CrewKind::Research => self.research_timeout_secs,
            CrewKind::Implementation => self.implementation_timeout_secs,
            CrewKind::Review => self.review_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    pub branch_prefix: String,
    pub author_name: String,
    pub author_email: String,
    /// HTTPS token for push. When unset, credential helpers and the SSH
    /// agent are tried instead.
    pub token: Option<String>,
    pub push_max_retries: u32,
    pub push_initial_backoff_ms: u64,
    pub push_max_backoff_ms: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch_prefix: "shepherd/".to_string(),
            author_name: "Shepherd Bot".to_string(),
            author_email: "shepherd-bot@users.noreply.github.com".to_string(),
            token: None,
            push_max_retries: 3,
            push_initial_backoff_ms: 1000,
            push_max_backoff_ms: 30_000,
        }
    }
}

// Manual Debug impl to avoid leaking the push token
impl std::fmt::Debug for GitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitConfig")
            .field("remote", &self.remote)
            .field("branch_prefix", &self.branch_prefix)
            .field("author_name", &self.author_name)
            .field("author_email", &self.author_email)
            .field("token", &self.token.as_ref().map(|_| REDACTED))
            .field("push_max_retries", &self.push_max_retries)
            .field("push_initial_backoff_ms", &self.push_initial_backoff_ms)
            .field("push_max_backoff_ms", &self.push_max_backoff_ms)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory that receives worktrees. Defaults to the repository's parent.
    pub worktree_root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    /// Review findings are recorded but never stop the push.
    #[default]
    Advisory,
    /// A `needs_changes` verdict fails the run before pushing.
    BlockOnNeedsChanges,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FlowConfig {
    pub review_policy: ReviewPolicy,
    /// Task descriptions shorter than this are rejected before any work.
    pub min_task_chars: usize,
    /// Shannon entropy floor, in bits per character, for task descriptions.
    pub min_task_entropy: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            review_policy: ReviewPolicy::Advisory,
            min_task_chars: 20,
            min_task_entropy: 2.5,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Append stage events as JSON lines to this file.
    pub events_file: Option<PathBuf>,
    /// Longest a single event emission may take before it is dropped.
    pub emit_timeout_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            events_file: None,
            emit_timeout_ms: 2000,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("shepherd").required(false));
        }

        // The conventional provider variable, used only when nothing else sets the key
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            builder = builder
                .set_default("claude.api_key", key)
                .map_err(|e| AppError::Config(e.to_string()))?;
        }

        // Environment variable overrides with SHEPHERD_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("SHEPHERD")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn claude_api_key(&self) -> Option<&str> {
        self.claude.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Render the effective configuration as TOML with secrets masked.
    pub fn redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.claude.api_key.is_some() {
            shown.claude.api_key = Some(REDACTED.to_string());
        }
        if shown.git.token.is_some() {
            shown.git.token = Some(REDACTED.to_string());
        }
        toml::to_string_pretty(&shown).map_err(|e| AppError::Config(e.to_string()))
    }
}
