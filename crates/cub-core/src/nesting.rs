//! Nesting prevention: refuses to start a loop inside another loop's
//! harness invocation.
//!
//! The loop sets [`crate::config::RUN_ACTIVE_ENV`] on every child process
//! it spawns (the harness, and any gate-check command). Before `Init`
//! completes, a new loop checks for this variable; if set, it is being
//! invoked by a parent loop (directly or via a hook handler shelling back
//! out) and must refuse. Hook handlers use the same variable to stand down
//! (spec.md I10) rather than double-recording events a loop already
//! records in the ledger.

use thiserror::Error;

use crate::config::RUN_ACTIVE_ENV;

#[derive(Debug, Error)]
pub enum NestingError {
    #[error("refusing to start: a parent run loop is already active (CUB_RUN_ACTIVE is set)")]
    AlreadyActive,
}

/// Whether the current process is running inside an active loop's harness
/// invocation (i.e. `CUB_RUN_ACTIVE` is set in the environment).
pub fn is_run_active() -> bool {
    std::env::var(RUN_ACTIVE_ENV).is_ok()
}

/// Require that no parent loop is active. Called once, before `Init`.
pub fn require_not_nested() -> Result<(), NestingError> {
    require_not_nested_with_value(std::env::var(RUN_ACTIVE_ENV).ok())
}

/// Testable variant that takes the environment value explicitly.
pub fn require_not_nested_with_value(value: Option<String>) -> Result<(), NestingError> {
    if value.is_some() {
        return Err(NestingError::AlreadyActive);
    }
    Ok(())
}
