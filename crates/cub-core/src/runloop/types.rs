//! Run-loop configuration, dependencies, and the run artifact (spec §4.7,
//! §6.3).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::budget::BudgetLimits;
use crate::config::CubConfig;
use crate::gate::CleanStateGate;
use crate::harness::Harness;
use crate::ledger::LedgerWriter;
use crate::task::TaskBackend;

/// Everything the run-loop invocation surface (spec §6.3) accepts.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub model: Option<String>,
    pub once: bool,
    pub task_filter: Option<String>,
    pub parent_filter: Option<String>,
    pub label_filter: Option<String>,
    pub budget: BudgetLimits,
    pub per_task_timeout: Option<Duration>,
    pub max_iterations: Option<u64>,
    pub stream: bool,
}

/// Collaborators wired up by the caller (the CLI's `run` command).
pub struct RunDeps {
    pub config: CubConfig,
    pub task_backend: Arc<dyn TaskBackend>,
    pub harness: Arc<dyn Harness>,
    pub ledger: Arc<LedgerWriter>,
    pub gate: CleanStateGate,
}

/// Summary written at finalisation, one per run (spec §4.7, I7).
#[derive(Debug, Clone, Serialize)]
pub struct RunArtifact {
    pub run_id: String,
    pub phase: String,
    pub reason: Option<String>,
    pub tasks_completed: u64,
    pub iterations: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunArtifact {
    pub fn path(config: &CubConfig, run_id: &str) -> PathBuf {
        config.run_sessions_dir().join(format!("{run_id}.artifact.json"))
    }
}

/// Outcome of the driving loop, before finalisation maps it onto a phase
/// and exit code.
#[derive(Debug)]
pub enum LoopStop {
    /// Terminated normally (exit 0): no ready tasks, `--once` satisfied,
    /// or an explicit `--task` closed.
    Done(&'static str),
    /// Halted itself (exit 0): budget exhaustion, stagnation, interrupt.
    Stopped(&'static str),
    /// Hard failure (exit 1): precheck failure, backend error, missing
    /// harness/auth, explicit task not found.
    Failed(String),
}

impl LoopStop {
    pub fn phase(&self) -> &'static str {
        match self {
            LoopStop::Done(_) => "completed",
            LoopStop::Stopped(_) => "stopped",
            LoopStop::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            LoopStop::Done(r) | LoopStop::Stopped(r) => Some(r.to_string()),
            LoopStop::Failed(r) => Some(r.clone()),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            LoopStop::Done(_) | LoopStop::Stopped(_) => 0,
            LoopStop::Failed(_) => 1,
        }
    }
}
