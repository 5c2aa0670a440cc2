//! Core components of the Cub autonomous coding orchestrator.
//!
//! `cub-core` implements the five collaborating pieces described by the
//! project's run-loop design: a task backend, a harness backend, a ledger
//! store, a forensics pipeline, and the run loop that ties them together,
//! plus the stateless services (prompt composer, budget accountant,
//! circuit breaker, clean-state gate) the loop consumes along the way.

pub mod breaker;
pub mod budget;
pub mod config;
pub mod forensics;
pub mod gate;
pub mod harness;
pub mod ledger;
pub mod nesting;
pub mod prompt;
pub mod runloop;
pub mod task;

pub use config::CubConfig;
