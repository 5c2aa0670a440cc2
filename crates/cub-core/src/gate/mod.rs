//! Clean-state gate (spec §4.6).
//!
//! Run once before each loop iteration (not before each attempt): a
//! sequence of checks, each returning `pass | warn | fail`, stopping at
//! the first `fail`. Grounded on the teacher's gate runner shape (run
//! each check, record a verdict, truncate captured output) generalized
//! from "invariants fetched from the DB and run per task" to "a small
//! fixed set of precondition checks run per iteration."

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::nesting;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Warn { message: String },
    Fail { message: String },
}

/// One precondition check the gate can run.
#[async_trait]
pub trait GateCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, working_dir: &Path) -> CheckOutcome;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GateCheck) {}
};

/// No uncommitted changes in the working tree (optionally scoped to
/// tracked files only).
pub struct VcsCleanCheck {
    pub tracked_only: bool,
}

#[async_trait]
impl GateCheck for VcsCleanCheck {
    fn name(&self) -> &str {
        "vcs_clean"
    }

    async fn run(&self, working_dir: &Path) -> CheckOutcome {
        let mut cmd = Command::new("git");
        cmd.arg("status").arg("--porcelain");
        if self.tracked_only {
            cmd.arg("--untracked-files=no");
        }
        cmd.current_dir(working_dir);
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                if output.stdout.is_empty() {
                    CheckOutcome::Pass
                } else {
                    CheckOutcome::Fail { message: "working tree has uncommitted changes".to_string() }
                }
            }
            Ok(output) => CheckOutcome::Fail {
                message: format!("git status failed: {}", truncate_snippet(&String::from_utf8_lossy(&output.stderr), 1024)),
            },
            Err(e) => CheckOutcome::Fail { message: format!("failed to run git: {e}") },
        }
    }
}

/// Runs an external command (tests, typecheck, lint); exit 0 is a pass.
pub struct CommandCheck {
    pub label: String,
    pub command: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
impl GateCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.label
    }

    async fn run(&self, working_dir: &Path) -> CheckOutcome {
        let Some((program, args)) = self.command.split_first() else {
            return CheckOutcome::Warn { message: format!("{} has no command configured", self.label) };
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(working_dir);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => CheckOutcome::Pass,
            Ok(Ok(output)) => CheckOutcome::Fail {
                message: format!(
                    "{} exited with {:?}: {}",
                    self.label,
                    output.status.code(),
                    truncate_snippet(&String::from_utf8_lossy(&output.stderr), 1024)
                ),
            },
            Ok(Err(e)) => CheckOutcome::Fail { message: format!("{} failed to run: {e}", self.label) },
            Err(_) => CheckOutcome::Fail { message: format!("{} timed out after {:?}", self.label, self.timeout) },
        }
    }
}

/// Refuses to run on `main`/`master` unless explicitly permitted
/// (`--main-ok`, spec §6.3).
pub struct CurrentBranchCheck {
    pub main_ok: bool,
}

#[async_trait]
impl GateCheck for CurrentBranchCheck {
    fn name(&self) -> &str {
        "current_branch"
    }

    async fn run(&self, working_dir: &Path) -> CheckOutcome {
        if self.main_ok {
            return CheckOutcome::Pass;
        }
        let mut cmd = Command::new("git");
        cmd.args(["branch", "--show-current"]).current_dir(working_dir);
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if branch == "main" || branch == "master" {
                    CheckOutcome::Fail { message: format!("refusing to run on branch {branch:?} without --main-ok") }
                } else {
                    CheckOutcome::Pass
                }
            }
            Ok(output) => CheckOutcome::Fail {
                message: format!("git branch failed: {}", truncate_snippet(&String::from_utf8_lossy(&output.stderr), 1024)),
            },
            Err(e) => CheckOutcome::Fail { message: format!("failed to run git: {e}") },
        }
    }
}

/// Refuses to run when a parent loop is already active.
pub struct NestingCheck;

#[async_trait]
impl GateCheck for NestingCheck {
    fn name(&self) -> &str {
        "nesting"
    }

    async fn run(&self, _working_dir: &Path) -> CheckOutcome {
        if nesting::is_run_active() {
            CheckOutcome::Fail { message: "a parent run loop is already active".to_string() }
        } else {
            CheckOutcome::Pass
        }
    }
}

/// Per-check result, as recorded in the run artifact.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub name: String,
    pub outcome: CheckOutcome,
}

/// Overall gate verdict: the first `Fail`, or `Pass`/`Warn` with every
/// check's report.
#[derive(Debug, Clone)]
pub enum GateVerdict {
    Pass { reports: Vec<CheckReport> },
    Warn { reports: Vec<CheckReport> },
    Fail { reports: Vec<CheckReport>, failed_check: String },
}

/// Sequence of checks run in declared order, stopping at the first fail.
pub struct CleanStateGate {
    checks: Vec<Box<dyn GateCheck>>,
}

impl CleanStateGate {
    pub fn new(checks: Vec<Box<dyn GateCheck>>) -> Self {
        Self { checks }
    }

    /// Run every check in order; stop (without running later checks) at
    /// the first `Fail`.
    pub async fn run(&self, working_dir: &Path) -> GateVerdict {
        let mut reports = Vec::new();
        let mut saw_warn = false;
        for check in &self.checks {
            let outcome = check.run(working_dir).await;
            let is_fail = matches!(outcome, CheckOutcome::Fail { .. });
            let is_warn = matches!(outcome, CheckOutcome::Warn { .. });
            let name = check.name().to_string();
            reports.push(CheckReport { name: name.clone(), outcome });
            if is_fail {
                return GateVerdict::Fail { reports, failed_check: name };
            }
            saw_warn = saw_warn || is_warn;
        }
        if saw_warn {
            GateVerdict::Warn { reports }
        } else {
            GateVerdict::Pass { reports }
        }
    }
}

/// Truncate a string to at most `max_bytes` bytes, appending "..." if
/// truncated.
pub fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

impl std::fmt::Debug for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateVerdict::Pass { reports } => write!(f, "Pass({} checks)", reports.len()),
            GateVerdict::Warn { reports } => write!(f, "Warn({} checks)", reports.len()),
            GateVerdict::Fail { failed_check, .. } => write!(f, "Fail({failed_check})"),
        }
    }
}
