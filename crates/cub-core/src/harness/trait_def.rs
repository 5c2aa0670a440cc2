//! The `Harness` trait -- the adapter interface for external coding
//! assistants.
//!
//! Each concrete harness (Claude Code, Codex CLI, ...) implements this
//! trait. It is intentionally object-safe so it can be stored as
//! `Box<dyn Harness>` in the [`super::HarnessRegistry`]. Where the
//! process-lifecycle-oriented precedent this is drawn from exposed
//! `spawn`/`events`/`send`/`kill`/`is_running` separately, this contract
//! folds the whole invocation into a single blocking `invoke` (spec §4.2):
//! the loop never needs partial control over a running harness process,
//! only its final, fully-captured result.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{InvokeRequest, InvokeResult};

/// Adapter interface for invoking an external coding assistant.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `dyn Harness` is
/// usable directly -- see [`super::HarnessRegistry`].
#[async_trait]
pub trait Harness: Send + Sync {
    /// Stable name (`claude`, `codex`, `gemini`, `opencode`, ...).
    fn name(&self) -> &str;

    /// Whether the underlying executable / credentials are present.
    async fn is_available(&self) -> bool;

    /// Model used when the request does not specify one.
    fn default_model(&self) -> &str;

    /// Run the assistant for one task prompt to completion.
    ///
    /// Must write the complete raw output to the harness-log path
    /// referenced by [`InvokeResult::captured_output`] before returning,
    /// streaming incrementally through `request.stream_callback` if one is
    /// given. Honors `request.cancel_token`: on first signal, begins
    /// graceful shutdown of the child and force-terminates after a short
    /// grace period.
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResult>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Harness) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::types::{ErrorCategory, StdinMode};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    /// A harness double that returns a canned result without touching a
    /// child process, used to prove the trait is usable as `dyn Harness`.
    struct NoopHarness;

    #[async_trait]
    impl Harness for NoopHarness {
        fn name(&self) -> &str {
            "noop"
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn default_model(&self) -> &str {
            "noop-model"
        }

        async fn invoke(&self, _request: InvokeRequest) -> Result<InvokeResult> {
            Ok(InvokeResult {
                success: true,
                exit_code: Some(0),
                tokens_in: Some(10),
                tokens_out: Some(5),
                cache_read: None,
                cache_write: None,
                cost_usd: Some(0.01),
                duration_s: 0.1,
                captured_output: PathBuf::from("/dev/null"),
                error_category: None,
                error_summary: None,
            })
        }
    }

    fn test_request() -> InvokeRequest {
        InvokeRequest {
            system_prompt: "sys".to_string(),
            task_prompt: "do the task".to_string(),
            model: None,
            cwd: PathBuf::from("/tmp"),
            env_overrides: HashMap::new(),
            stdin_mode: StdinMode::Argument,
            stream_callback: None,
            cancel_token: CancellationToken::new(),
            timeout: std::time::Duration::from_secs(60),
        }
    }

    #[test]
    fn harness_is_object_safe() {
        let harness: Box<dyn Harness> = Box::new(NoopHarness);
        assert_eq!(harness.name(), "noop");
    }

    #[tokio::test]
    async fn noop_harness_invokes_and_reports_success() {
        let harness: Box<dyn Harness> = Box::new(NoopHarness);
        assert!(harness.is_available().await);
        let result = harness.invoke(test_request()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.error_category, None::<ErrorCategory>);
    }
}
