//! Claude Code harness adapter.
//!
//! Spawns `claude -p --output-format stream-json` and parses its JSONL
//! output into a single [`InvokeResult`], streaming raw lines through the
//! caller's callback as they arrive and writing the complete capture to a
//! log file under the project's `.cub` directory.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::trait_def::Harness;
use super::types::{ErrorCategory, InvokeRequest, InvokeResult, StdinMode};

/// Harness adapter for Claude Code.
#[derive(Clone)]
pub struct ClaudeHarness {
    binary_path: String,
}

impl std::fmt::Debug for ClaudeHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeHarness").field("binary_path", &self.binary_path).finish()
    }
}

impl ClaudeHarness {
    /// Look for `claude` on `$PATH`.
    pub fn new() -> Self {
        Self { binary_path: "claude".to_string() }
    }

    /// Use a custom binary path; useful for tests.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self { binary_path: path.into() }
    }
}

impl Default for ClaudeHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulated usage and terminal-message state parsed out of the
/// stream-json lines as they arrive.
#[derive(Default)]
struct ParseState {
    tokens_in: Option<u64>,
    tokens_out: Option<u64>,
    cache_read: Option<u64>,
    cache_write: Option<u64>,
    cost_usd: Option<f64>,
    final_message: Option<String>,
    error: Option<(ErrorCategory, String)>,
}

fn classify_error_text(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        ErrorCategory::RateLimit
    } else if lower.contains("auth") || lower.contains("unauthorized") || lower.contains("api key") {
        ErrorCategory::Auth
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("network") || lower.contains("connection") {
        ErrorCategory::Network
    } else {
        ErrorCategory::ModelError
    }
}

/// Fold a single stream-json line into `state`, returning the line's
/// plain-text contribution (if any) for the stream callback.
fn apply_stream_json_line(state: &mut ParseState, line: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(line).ok()?;
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let extract_usage = |usage: &serde_json::Value, state: &mut ParseState| {
        if let Some(n) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
            state.tokens_in = Some(state.tokens_in.unwrap_or(0) + n);
        }
        if let Some(n) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
            state.tokens_out = Some(state.tokens_out.unwrap_or(0) + n);
        }
        if let Some(n) = usage.get("cache_read_input_tokens").and_then(|v| v.as_u64()) {
            state.cache_read = Some(state.cache_read.unwrap_or(0) + n);
        }
        if let Some(n) = usage.get("cache_creation_input_tokens").and_then(|v| v.as_u64()) {
            state.cache_write = Some(state.cache_write.unwrap_or(0) + n);
        }
    };

    match event_type {
        "assistant" => {
            let message = v.get("message")?;
            let mut text = None;
            if let Some(content) = message.get("content").and_then(|c| c.as_array()) {
                for block in content {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text = Some(t.to_string());
                        }
                    }
                }
            }
            if let Some(usage) = message.get("usage") {
                extract_usage(usage, state);
            }
            text
        }
        "result" => {
            if let Some(cost) = v.get("total_cost_usd").and_then(|c| c.as_f64()) {
                state.cost_usd = Some(cost);
            }
            if let Some(usage) = v.get("usage") {
                extract_usage(usage, state);
            }
            if let Some(result_text) = v.get("result").and_then(|r| r.as_str()) {
                state.final_message = Some(result_text.to_string());
            }
            let is_error = v.get("is_error").and_then(|b| b.as_bool()).unwrap_or(false);
            if is_error {
                let msg = v
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or("harness reported an error result")
                    .to_string();
                state.error = Some((classify_error_text(&msg), msg));
            }
            None
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown harness error")
                .to_string();
            state.error = Some((classify_error_text(&message), message));
            None
        }
        other => {
            debug!(event_type = other, "ignoring unrecognised stream-json event type");
            None
        }
    }
}

#[async_trait]
impl Harness for ClaudeHarness {
    fn name(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn default_model(&self) -> &str {
        "claude-sonnet"
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResult> {
        let start = tokio::time::Instant::now();
        let log_dir = request.cwd.join(".cub").join("harness-output");
        tokio::fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("creating harness output dir {}", log_dir.display()))?;
        let log_path = log_dir.join(format!("{}.log", uuid::Uuid::new_v4()));

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--append-system-prompt")
            .arg(&request.system_prompt);

        if let Some(model) = request.model.as_deref().or(Some(self.default_model())) {
            cmd.arg("--model").arg(model);
        }

        match request.stdin_mode {
            StdinMode::Argument => {
                cmd.arg(&request.task_prompt);
                cmd.stdin(Stdio::null());
            }
            StdinMode::Pipe => {
                cmd.stdin(Stdio::piped());
            }
        }

        cmd.current_dir(&request.cwd);
        for (key, value) in &request.env_overrides {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn '{}' -- is the harness executable installed and on PATH?",
                self.binary_path
            )
        })?;

        if matches!(request.stdin_mode, StdinMode::Pipe) {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(request.task_prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        }

        let stdout = child.stdout.take().context("child process has no stdout")?;
        let mut log_file = tokio::fs::File::create(&log_path)
            .await
            .with_context(|| format!("creating harness log at {}", log_path.display()))?;

        let mut state = ParseState::default();
        let mut reader = BufReader::new(stdout).lines();

        let run_to_completion = async {
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        let _ = log_file.write_all(line.as_bytes()).await;
                        let _ = log_file.write_all(b"\n").await;
                        if let Some(text) = apply_stream_json_line(&mut state, &line) {
                            if let Some(cb) = &request.stream_callback {
                                cb(&text);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading harness stdout");
                        break;
                    }
                }
            }
        };

        let cancelled = tokio::select! {
            _ = run_to_completion => false,
            _ = request.cancel_token.cancelled() => {
                state.error = Some((ErrorCategory::Internal, "harness invocation cancelled".to_string()));
                true
            }
            _ = tokio::time::sleep(request.timeout) => {
                state.error = Some((ErrorCategory::Timeout, "harness invocation timed out".to_string()));
                true
            }
        };

        if cancelled {
            terminate_child(&mut child).await;
        }

        let status = child.wait().await.ok();
        let exit_code = status.and_then(|s| s.code());
        let duration_s = start.elapsed().as_secs_f64();

        let (error_category, error_summary) = match state.error {
            Some((cat, msg)) => (Some(cat), Some(msg)),
            None if exit_code.unwrap_or(1) != 0 => (
                Some(ErrorCategory::Unknown),
                Some(format!("harness exited with status {exit_code:?}")),
            ),
            None => (None, None),
        };
        let success = error_category.is_none();

        Ok(InvokeResult {
            success,
            exit_code,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            cache_read: state.cache_read,
            cache_write: state.cache_write,
            cost_usd: state.cost_usd,
            duration_s,
            captured_output: log_path,
            error_category,
            error_summary,
        })
    }
}

async fn terminate_child(child: &mut tokio::process::Child) {
    let pid = match child.id() {
        Some(pid) => pid,
        None => return,
    };
    #[cfg(unix)]
    {
        // SAFETY: pid is a valid process id from a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding straight to SIGKILL");
        }
    }
    let exited = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await;
    if exited.is_err() {
        debug!(pid, "harness did not exit after SIGTERM, sending SIGKILL");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn request(cwd: &std::path::Path) -> InvokeRequest {
        InvokeRequest {
            system_prompt: "you are working on a task".to_string(),
            task_prompt: "finish it".to_string(),
            model: None,
            cwd: cwd.to_path_buf(),
            env_overrides: HashMap::new(),
            stdin_mode: StdinMode::Argument,
            stream_callback: None,
            cancel_token: CancellationToken::new(),
            timeout: std::time::Duration::from_secs(10),
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn classify_errors_from_message_text() {
        assert_eq!(classify_error_text("Rate limit exceeded"), ErrorCategory::RateLimit);
        assert_eq!(classify_error_text("Invalid API key"), ErrorCategory::Auth);
        assert_eq!(classify_error_text("connection reset"), ErrorCategory::Network);
        assert_eq!(classify_error_text("request timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_error_text("something odd"), ErrorCategory::ModelError);
    }

    #[test]
    fn apply_assistant_line_extracts_text_and_usage() {
        let mut state = ParseState::default();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#;
        let text = apply_stream_json_line(&mut state, line);
        assert_eq!(text.as_deref(), Some("hello"));
        assert_eq!(state.tokens_in, Some(10));
        assert_eq!(state.tokens_out, Some(5));
    }

    #[test]
    fn apply_result_line_extracts_cost_and_error() {
        let mut state = ParseState::default();
        let line = r#"{"type":"result","total_cost_usd":0.42,"is_error":true,"result":"boom"}"#;
        apply_stream_json_line(&mut state, line);
        assert_eq!(state.cost_usd, Some(0.42));
        assert_eq!(state.error.as_ref().unwrap().1, "boom");
    }

    #[tokio::test]
    async fn invoke_reports_success_for_a_clean_result() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_claude.sh",
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":10,"output_tokens":5}}}'
echo '{"type":"result","result":"done","total_cost_usd":0.01,"usage":{"input_tokens":20,"output_tokens":8}}'"#,
        );
        let harness = ClaudeHarness::with_binary(script.to_str().unwrap());
        let result = harness.invoke(request(tmp.path())).await.unwrap();
        assert!(result.success);
        assert_eq!(result.tokens_in, Some(30));
        assert_eq!(result.tokens_out, Some(13));
        assert_eq!(result.cost_usd, Some(0.01));
        assert!(result.captured_output.exists());
    }

    #[tokio::test]
    async fn invoke_reports_error_result() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "bad_claude.sh",
            r#"echo '{"type":"result","is_error":true,"result":"rate limit exceeded"}'"#,
        );
        let harness = ClaudeHarness::with_binary(script.to_str().unwrap());
        let result = harness.invoke(request(tmp.path())).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_category, Some(ErrorCategory::RateLimit));
    }

    #[tokio::test]
    async fn invoke_fails_fast_on_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let harness = ClaudeHarness::with_binary("/nonexistent/claude-binary");
        let err = harness.invoke(request(tmp.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[tokio::test]
    async fn invoke_respects_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_claude.sh", "sleep 3600");
        let harness = ClaudeHarness::with_binary(script.to_str().unwrap());

        let mut req = request(tmp.path());
        let cancel = CancellationToken::new();
        req.cancel_token = cancel.clone();
        req.timeout = std::time::Duration::from_secs(3600);

        let invoke = tokio::spawn(async move { harness.invoke(req).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), invoke)
            .await
            .expect("invoke should return promptly after cancellation")
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_category, Some(ErrorCategory::Internal));
    }

    #[tokio::test]
    async fn is_available_false_for_missing_binary() {
        let harness = ClaudeHarness::with_binary("/nonexistent/claude-binary");
        assert!(!harness.is_available().await);
    }

    #[test]
    fn adapter_name_and_default_model() {
        let harness = ClaudeHarness::new();
        assert_eq!(harness.name(), "claude");
        assert_eq!(harness.default_model(), "claude-sonnet");
    }
}
