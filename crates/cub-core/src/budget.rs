//! Budget accountant (spec §4.4).
//!
//! Tracks cumulative cost/tokens/tasks/iterations for a run and decides
//! when the loop must stop. No teacher precedent: the teacher tracked a
//! per-task `token_budget` column but never accumulated or enforced it
//! across a run, so this is built fresh from the spec, in the style of
//! the teacher's other small stateful accountants (the circuit breaker's
//! ring buffer).

use serde::{Deserialize, Serialize};

use crate::harness::InvokeResult;

/// Configured limits; any may be absent, meaning unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_cost_usd: Option<f64>,
    pub max_tokens: Option<u64>,
    pub max_tasks: Option<u64>,
    pub max_iterations: Option<u64>,
    /// Fraction of any limit at which a single warning fires (e.g. 0.8).
    pub warn_at: Option<f64>,
}

/// Which limit caused exhaustion, for the run artifact / stopped reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedLimit {
    Cost,
    Tokens,
    Tasks,
    Iterations,
}

/// Running totals for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetAccountant {
    limits: BudgetLimits,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub tasks_completed: u64,
    pub iterations: u64,
    /// Whether `warn_at` has already fired once, per limit kind, so it
    /// only fires a single time per run.
    #[serde(default)]
    warned: Vec<ExhaustedLimit>,
    /// True if any accounted attempt reported unknown usage -- the
    /// accountant treats unknown as zero but flags it (spec §4.2).
    #[serde(default)]
    pub saw_unknown_usage: bool,
}

impl BudgetAccountant {
    pub fn new(limits: BudgetLimits) -> Self {
        Self { limits, ..Default::default() }
    }

    /// Record the start of a new loop iteration.
    pub fn enter_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Fold one attempt's usage into the running totals.
    pub fn account_attempt(&mut self, result: &InvokeResult) {
        if result.has_unknown_usage() {
            self.saw_unknown_usage = true;
        }
        self.tokens_used += result.tokens_in.unwrap_or(0) + result.tokens_out.unwrap_or(0);
        self.cost_usd += result.cost_usd.unwrap_or(0.0);
    }

    pub fn account_task_completed(&mut self) {
        self.tasks_completed += 1;
    }

    /// Whether any configured limit has been met or exceeded.
    pub fn is_exhausted(&self) -> Option<ExhaustedLimit> {
        if let Some(max) = self.limits.max_cost_usd {
            if self.cost_usd >= max {
                return Some(ExhaustedLimit::Cost);
            }
        }
        if let Some(max) = self.limits.max_tokens {
            if self.tokens_used >= max {
                return Some(ExhaustedLimit::Tokens);
            }
        }
        if let Some(max) = self.limits.max_tasks {
            if self.tasks_completed >= max {
                return Some(ExhaustedLimit::Tasks);
            }
        }
        if let Some(max) = self.limits.max_iterations {
            if self.iterations >= max {
                return Some(ExhaustedLimit::Iterations);
            }
        }
        None
    }

    /// Limits newly crossed past `warn_at` since the last call, each
    /// returned (and recorded as warned) at most once per run.
    pub fn newly_crossed_warnings(&mut self) -> Vec<ExhaustedLimit> {
        let Some(warn_at) = self.limits.warn_at else {
            return Vec::new();
        };
        let mut newly = Vec::new();
        let checks: [(ExhaustedLimit, Option<f64>, f64); 4] = [
            (ExhaustedLimit::Cost, self.limits.max_cost_usd, self.cost_usd),
            (ExhaustedLimit::Tokens, self.limits.max_tokens.map(|v| v as f64), self.tokens_used as f64),
            (ExhaustedLimit::Tasks, self.limits.max_tasks.map(|v| v as f64), self.tasks_completed as f64),
            (ExhaustedLimit::Iterations, self.limits.max_iterations.map(|v| v as f64), self.iterations as f64),
        ];
        for (kind, max, current) in checks {
            let Some(max) = max else { continue };
            if max <= 0.0 {
                continue;
            }
            if current / max >= warn_at && !self.warned.contains(&kind) {
                self.warned.push(kind);
                newly.push(kind);
            }
        }
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn result(tokens_in: u64, tokens_out: u64, cost: f64) -> InvokeResult {
        InvokeResult {
            success: true,
            exit_code: Some(0),
            tokens_in: Some(tokens_in),
            tokens_out: Some(tokens_out),
            cache_read: None,
            cache_write: None,
            cost_usd: Some(cost),
            duration_s: 1.0,
            captured_output: PathBuf::from("/dev/null"),
            error_category: None,
            error_summary: None,
        }
    }

    #[test]
    fn not_exhausted_with_no_limits() {
        let mut acc = BudgetAccountant::new(BudgetLimits::default());
        acc.account_attempt(&result(1000, 1000, 10.0));
        assert!(acc.is_exhausted().is_none());
    }

    #[test]
    fn cost_limit_trips_when_met() {
        let mut acc = BudgetAccountant::new(BudgetLimits { max_cost_usd: Some(5.0), ..Default::default() });
        acc.account_attempt(&result(0, 0, 5.0));
        assert_eq!(acc.is_exhausted(), Some(ExhaustedLimit::Cost));
    }

    #[test]
    fn token_limit_trips_when_exceeded() {
        let mut acc = BudgetAccountant::new(BudgetLimits { max_tokens: Some(100), ..Default::default() });
        acc.account_attempt(&result(80, 30, 0.0));
        assert_eq!(acc.is_exhausted(), Some(ExhaustedLimit::Tokens));
    }

    #[test]
    fn task_and_iteration_limits() {
        let mut acc = BudgetAccountant::new(BudgetLimits { max_tasks: Some(1), ..Default::default() });
        assert!(acc.is_exhausted().is_none());
        acc.account_task_completed();
        assert_eq!(acc.is_exhausted(), Some(ExhaustedLimit::Tasks));

        let mut acc = BudgetAccountant::new(BudgetLimits { max_iterations: Some(2), ..Default::default() });
        acc.enter_iteration();
        assert!(acc.is_exhausted().is_none());
        acc.enter_iteration();
        assert_eq!(acc.is_exhausted(), Some(ExhaustedLimit::Iterations));
    }

    #[test]
    fn unknown_usage_is_flagged_but_treated_as_zero() {
        let mut acc = BudgetAccountant::new(BudgetLimits { max_tokens: Some(10), ..Default::default() });
        let mut unknown = result(0, 0, 0.0);
        unknown.tokens_in = None;
        acc.account_attempt(&unknown);
        assert!(acc.saw_unknown_usage);
        assert_eq!(acc.tokens_used, 0);
        assert!(acc.is_exhausted().is_none());
    }

    #[test]
    fn warn_at_fires_once_per_limit() {
        let mut acc = BudgetAccountant::new(BudgetLimits {
            max_cost_usd: Some(10.0),
            warn_at: Some(0.8),
            ..Default::default()
        });
        acc.account_attempt(&result(0, 0, 8.5));
        assert_eq!(acc.newly_crossed_warnings(), vec![ExhaustedLimit::Cost]);
        assert!(acc.newly_crossed_warnings().is_empty());
    }
}
