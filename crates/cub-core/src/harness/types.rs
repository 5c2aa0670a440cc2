//! Shared request/result types for the [`super::Harness`] contract.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

/// How the harness should receive the composed prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    /// Prompt passed as a CLI argument (e.g. `-p <prompt>`).
    Argument,
    /// Prompt written to the child's stdin.
    Pipe,
}

/// Callback invoked with each raw output chunk as it is produced, in
/// addition to the complete capture written to the harness log.
pub type StreamCallback = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// One invocation of an external assistant for a single task prompt.
pub struct InvokeRequest {
    pub system_prompt: String,
    pub task_prompt: String,
    pub model: Option<String>,
    pub cwd: PathBuf,
    pub env_overrides: HashMap<String, String>,
    pub stdin_mode: StdinMode,
    pub stream_callback: Option<StreamCallback>,
    pub cancel_token: CancellationToken,
    pub timeout: std::time::Duration,
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("system_prompt_len", &self.system_prompt.len())
            .field("task_prompt_len", &self.task_prompt.len())
            .field("model", &self.model)
            .field("cwd", &self.cwd)
            .field("env_overrides", &self.env_overrides)
            .field("stdin_mode", &self.stdin_mode)
            .field("has_stream_callback", &self.stream_callback.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Closed set of failure categories the loop keys retry/escalation
/// decisions off (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    HarnessMissing,
    Auth,
    RateLimit,
    Network,
    Timeout,
    ModelError,
    Internal,
    Unknown,
}

impl ErrorCategory {
    /// Whether the loop should retry the same task on the next iteration
    /// rather than count this toward escalation immediately.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Timeout)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::HarnessMissing => "harness_missing",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Token/cost fields use `None` for "unknown" (spec §4.2): the accountant
/// treats unknown as zero but flags the attempt.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
    pub cost_usd: Option<f64>,
    pub duration_s: f64,
    pub captured_output: PathBuf,
    pub error_category: Option<ErrorCategory>,
    pub error_summary: Option<String>,
}

impl InvokeResult {
    /// Whether any of the usage fields were unavailable from this harness.
    pub fn has_unknown_usage(&self) -> bool {
        self.tokens_in.is_none() || self.tokens_out.is_none() || self.cost_usd.is_none()
    }
}
