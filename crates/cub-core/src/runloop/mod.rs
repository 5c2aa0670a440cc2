//! Run loop state machine (spec §4.7): `Init -> Prechecks -> Select ->
//! Compose -> Dispatch -> Record -> PostCheck -> {Prechecks | Done |
//! Failed | Stopped}`.
//!
//! No direct teacher module owns a run loop; grounded on the harness's
//! own spawn/stream/await shape for the Dispatch/Record half, and on the
//! gate/budget/breaker modules already built for the surrounding control
//! flow. `tokio_util::sync::CancellationToken` plus `tokio::select!`
//! (the same pairing the harness module uses for per-invocation
//! cancellation) drives SIGINT handling here at the loop level.

pub mod session;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::RUN_ACTIVE_ENV;
use crate::gate::GateVerdict;
use crate::harness::{InvokeRequest, StdinMode};
use crate::ledger::{
    Attempt, EntrySource, Lineage, Outcome, TaskSnapshot, TokenUsage, Verification,
    VerificationStatus, WorkflowStage,
};
use crate::nesting;
use crate::prompt::{compose, ComposerInput, RetrySummary};
use crate::task::{BackendError, Task, TaskFilters, TaskStatus};

pub use session::RunSession;
pub use types::{LoopStop, RunArtifact, RunConfig, RunDeps};

/// Spawn a background task that cancels `cancel` on the first SIGINT
/// (Ctrl-C) and hard-exits with code 130 on the second. Returns the
/// spawned task's handle so the caller can abort it after the run ends.
fn install_interrupt_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    })
}

/// Drive one full run loop to completion, writing the run-session file,
/// the `active-run` designator, and the final run artifact.
pub async fn run(run_id: String, config: RunConfig, deps: RunDeps) -> Result<(RunArtifact, i32)> {
    nesting::require_not_nested()?;

    let session = RunSession::acquire(&deps.config, run_id.clone())?;
    let cancel = CancellationToken::new();
    let interrupt_task = install_interrupt_handler(cancel.clone());

    let started_at = Utc::now();
    let mut budget = crate::budget::BudgetAccountant::new(config.budget.clone());
    let mut breaker = crate::breaker::CircuitBreaker::new();

    let stop = drive(&run_id, &config, &deps, &session, &mut budget, &mut breaker, &cancel).await;
    interrupt_task.abort();

    let _ = session.finalize(stop.phase(), stop.reason().as_deref());

    let artifact = RunArtifact {
        run_id: run_id.clone(),
        phase: stop.phase().to_string(),
        reason: stop.reason(),
        tasks_completed: budget.tasks_completed,
        iterations: budget.iterations,
        tokens_used: budget.tokens_used,
        cost_usd: budget.cost_usd,
        started_at,
        ended_at: Utc::now(),
    };
    write_run_artifact(&deps, &artifact)?;

    let exit_code = stop.exit_code();
    Ok((artifact, exit_code))
}

fn write_run_artifact(deps: &RunDeps, artifact: &RunArtifact) -> Result<()> {
    let path = RunArtifact::path(&deps.config, &artifact.run_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serde_json::to_string_pretty(artifact)?)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

async fn drive(
    run_id: &str,
    config: &RunConfig,
    deps: &RunDeps,
    session: &RunSession,
    budget: &mut crate::budget::BudgetAccountant,
    breaker: &mut crate::breaker::CircuitBreaker,
    cancel: &CancellationToken,
) -> LoopStop {
    let mut pending_retry: Option<Task> = None;

    loop {
        if cancel.is_cancelled() {
            return LoopStop::Stopped("interrupted");
        }

        let _ = session.set_phase("prechecks");
        match deps.gate.run(&deps.config.project_dir).await {
            GateVerdict::Fail { failed_check, .. } => {
                return LoopStop::Failed(format!("precheck_failed: {failed_check}"));
            }
            GateVerdict::Warn { .. } | GateVerdict::Pass { .. } => {}
        }

        let _ = session.set_phase("select");
        let task = match select_task(config, deps, &mut pending_retry).await {
            Ok(Some(task)) => task,
            Ok(None) => return LoopStop::Done("no_ready_tasks"),
            Err(stop) => return stop,
        };

        budget.enter_iteration();

        let _ = session.set_phase("compose");
        let (entry, system_prompt, task_prompt, attempt_number) = match compose_for_task(deps, &task) {
            Ok(v) => v,
            Err(e) => return LoopStop::Failed(format!("ledger_io: {e}")),
        };
        let _ = deps.ledger.write_prompt_file(&task.id, attempt_number, run_id, &system_prompt, &task_prompt);

        let _ = session.set_phase("dispatch");
        if task.status == TaskStatus::Open {
            if let Err(stop) = claim_with_retry(deps, &task.id, run_id).await {
                return stop;
            }
        }

        let model = config
            .model
            .clone()
            .or_else(|| task.model_override().map(str::to_string))
            .unwrap_or_else(|| deps.harness.default_model().to_string());

        let mut env_overrides = HashMap::new();
        env_overrides.insert(RUN_ACTIVE_ENV.to_string(), "1".to_string());

        let request = InvokeRequest {
            system_prompt,
            task_prompt,
            model: Some(model.clone()),
            cwd: deps.config.project_dir.clone(),
            env_overrides,
            stdin_mode: StdinMode::Argument,
            stream_callback: None,
            cancel_token: cancel.child_token(),
            timeout: config.per_task_timeout.unwrap_or(Duration::from_secs(3600)),
        };

        let invoke_result = match deps.harness.invoke(request).await {
            Ok(r) => r,
            Err(e) => return LoopStop::Failed(format!("internal: {e}")),
        };

        let _ = session.set_phase("record");
        let _ = deps.ledger.write_harness_log(
            &task.id,
            attempt_number,
            &format!("captured output at {}", invoke_result.captured_output.display()),
        );

        let _ = entry; // entry snapshot only needed to compute attempt_number above
        let attempt = Attempt {
            attempt_number,
            run_id: run_id.to_string(),
            started_at: Utc::now() - chrono::Duration::milliseconds((invoke_result.duration_s * 1000.0) as i64),
            completed_at: Some(Utc::now()),
            harness: deps.harness.name().to_string(),
            model: model.clone(),
            success: invoke_result.success,
            error_category: invoke_result.error_category.map(|c| c.to_string()),
            error_summary: invoke_result.error_summary.clone(),
            tokens: TokenUsage {
                input: invoke_result.tokens_in,
                output: invoke_result.tokens_out,
                cache_read: invoke_result.cache_read,
                cache_write: invoke_result.cache_write,
            },
            cost_usd: invoke_result.cost_usd,
            duration_s: invoke_result.duration_s,
        };
        let updated_entry = match deps.ledger.append_attempt(&task.id, attempt) {
            Ok(e) => e,
            Err(e) => return LoopStop::Failed(format!("ledger_io: {e}")),
        };
        budget.account_attempt(&invoke_result);

        let task_after = deps.task_backend.get(&task.id).await.ok();
        let task_closed = task_after.as_ref().is_some_and(|t| t.status == TaskStatus::Closed);

        if invoke_result.success && task_closed {
            finalize_success(deps, &task.id, &updated_entry).await;
            budget.account_task_completed();
            if let Some(trip_reason) = breaker.record(crate::breaker::IterationOutcome {
                task_id: task.id.clone(),
                success: true,
                error_category: None,
            }) {
                return LoopStop::Stopped(trip_reason_str(trip_reason));
            }
            pending_retry = None;
        } else {
            let category = invoke_result.error_category;
            if matches!(
                category,
                Some(crate::harness::ErrorCategory::HarnessMissing) | Some(crate::harness::ErrorCategory::Auth)
            ) {
                return LoopStop::Failed(format!(
                    "{}",
                    category.map(|c| c.to_string()).unwrap_or_default()
                ));
            }
            pending_retry = task_after;
            if let Some(trip_reason) = breaker.record(crate::breaker::IterationOutcome {
                task_id: task.id.clone(),
                success: false,
                error_category: category,
            }) {
                return LoopStop::Stopped(trip_reason_str(trip_reason));
            }
        }

        let _ = session.set_phase("postcheck");
        if budget.is_exhausted().is_some() {
            return LoopStop::Stopped("budget_exhausted");
        }
        if config.once {
            return LoopStop::Done("once");
        }
        if let Some(max_iterations) = config.max_iterations {
            if budget.iterations >= max_iterations {
                return LoopStop::Stopped("max_iterations");
            }
        }
        if cancel.is_cancelled() {
            return LoopStop::Stopped("interrupted");
        }
    }
}

fn trip_reason_str(reason: crate::breaker::TripReason) -> &'static str {
    match reason {
        crate::breaker::TripReason::SameTaskFailures
        | crate::breaker::TripReason::NonRetryableFailures
        | crate::breaker::TripReason::NoProgress => "stagnation",
    }
}

async fn select_task(
    config: &RunConfig,
    deps: &RunDeps,
    pending_retry: &mut Option<Task>,
) -> Result<Option<Task>, LoopStop> {
    if let Some(task) = pending_retry.take() {
        return Ok(Some(task));
    }

    if let Some(explicit_id) = &config.task_filter {
        let task = match deps.task_backend.get(explicit_id).await {
            Ok(t) => t,
            Err(BackendError::NotFound(_)) => return Err(LoopStop::Failed("task_not_found".to_string())),
            Err(e) => return Err(LoopStop::Failed(format!("backend_error: {e}"))),
        };
        if task.status == TaskStatus::Closed {
            return Err(LoopStop::Done("task_closed"));
        }
        if task.status != TaskStatus::Open {
            return Ok(None);
        }
        return Ok(Some(task));
    }

    let filters = TaskFilters {
        parent: config.parent_filter.clone(),
        label: config.label_filter.clone(),
        task_id: None,
    };
    let ready = deps
        .task_backend
        .ready(&filters)
        .await
        .map_err(|e| LoopStop::Failed(format!("backend_error: {e}")))?;
    Ok(ready.into_iter().next())
}

fn compose_for_task(
    deps: &RunDeps,
    task: &Task,
) -> anyhow::Result<(crate::ledger::LedgerEntry, String, String, u32)> {
    let snapshot = TaskSnapshot {
        title: task.title.clone(),
        description: task.description.clone(),
        task_type: task.task_type,
        priority: task.priority,
        labels: task.labels.clone(),
        created_at: task.created_at,
        captured_at: Utc::now(),
    };
    let lineage = Lineage { parent_epic_id: task.parent.clone(), ..Default::default() };
    let entry = deps.ledger.create_task_entry(&task.id, snapshot, lineage, EntrySource::Loop)?;

    let retries: Vec<RetrySummary> = entry
        .attempts
        .iter()
        .map(|a| RetrySummary {
            attempt_index: a.attempt_number,
            error_category: a.error_category.clone(),
            error_summary: a.error_summary.clone(),
        })
        .collect();
    let composer_input = ComposerInput {
        project_dir: deps.config.project_dir.clone(),
        task,
        plan: None,
        epic: None,
        retries,
    };
    let (system_prompt, task_prompt) = compose(&composer_input);
    let attempt_number = entry.next_attempt_number();
    Ok((entry, system_prompt, task_prompt, attempt_number))
}

async fn claim_with_retry(deps: &RunDeps, task_id: &str, session_id: &str) -> Result<(), LoopStop> {
    match deps.task_backend.claim(task_id, session_id).await {
        Ok(()) => Ok(()),
        Err(BackendError::Race(_)) => match deps.task_backend.claim(task_id, session_id).await {
            Ok(()) => Ok(()),
            Err(_) => Err(LoopStop::Failed("backend_race".to_string())),
        },
        Err(e) => Err(LoopStop::Failed(format!("backend_error: {e}"))),
    }
}

async fn finalize_success(deps: &RunDeps, task_id: &str, entry: &crate::ledger::LedgerEntry) {
    let total_cost_usd: f64 = entry.attempts.iter().filter_map(|a| a.cost_usd).sum();
    let total_duration_s: f64 = entry.attempts.iter().map(|a| a.duration_s).sum();
    let final_model = entry.attempts.last().map(|a| a.model.clone()).unwrap_or_default();
    let escalation_path: Vec<String> = entry.attempts.iter().map(|a| a.model.clone()).collect();

    let files_changed = changed_files(&deps.config.project_dir).await;
    let verification = run_verification(deps).await;
    let _ = deps.ledger.record_verification(task_id, verification);

    let outcome = Outcome {
        success: true,
        partial: false,
        completed_at: Utc::now(),
        total_cost_usd,
        total_attempts: entry.attempts.len() as u32,
        total_duration_s,
        final_model,
        escalation_path,
        files_changed,
        commit_refs: vec![],
        approach: String::new(),
        key_decisions: vec![],
        lessons_learned: vec![],
    };
    let _ = deps.ledger.finalize_task_entry(task_id, outcome);
    let _ = deps
        .ledger
        .update_workflow_stage(task_id, WorkflowStage::DevComplete, "loop", "attempt succeeded and task closed", false);
}

/// Report-only re-run of the clean-state gate after an attempt, to
/// populate the ledger entry's `verification` field (spec §4.7 Record).
async fn run_verification(deps: &RunDeps) -> Verification {
    let status = match deps.gate.run(&deps.config.project_dir).await {
        GateVerdict::Pass { .. } => VerificationStatus::Pass,
        GateVerdict::Warn { .. } => VerificationStatus::Warn,
        GateVerdict::Fail { .. } => VerificationStatus::Fail,
    };
    Verification { status, checked_at: Some(Utc::now()), tests_passed: None, typecheck_passed: None, lint_passed: None, notes: String::new() }
}

async fn changed_files(project_dir: &Path) -> Vec<String> {
    let Ok(output) = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(project_dir)
        .output()
        .await
    else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.get(3..).map(str::to_string))
        .collect()
}
