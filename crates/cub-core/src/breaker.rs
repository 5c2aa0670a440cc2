//! Circuit breaker / stagnation detector (spec §4.5).
//!
//! Grounded on the teacher's orchestrator retry/escalation bookkeeping,
//! generalized from "per-task concurrent scheduling" down to the single
//! task the loop works on at a time: the ring buffer and non-retryable
//! trip condition carry over, the concurrency-fairness logic does not.

use std::collections::VecDeque;

use crate::harness::ErrorCategory;

const DEFAULT_RING_SIZE: usize = 5;
const DEFAULT_SAME_TASK_TRIP: u32 = 3;
const DEFAULT_NON_RETRYABLE_TRIP: u32 = 3;
const DEFAULT_NO_PROGRESS_TRIP: u32 = 10;

/// Non-retryable categories that count toward the overall-failure trip
/// even across distinct tasks (spec §4.5).
fn is_non_retryable(category: ErrorCategory) -> bool {
    matches!(category, ErrorCategory::HarnessMissing | ErrorCategory::Auth)
}

#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub task_id: String,
    pub success: bool,
    pub error_category: Option<ErrorCategory>,
}

/// Why the breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    SameTaskFailures,
    NonRetryableFailures,
    NoProgress,
}

pub struct CircuitBreaker {
    ring_size: usize,
    same_task_trip: u32,
    non_retryable_trip: u32,
    no_progress_trip: u32,
    ring: VecDeque<IterationOutcome>,
    consecutive_same_task_failures: u32,
    last_failed_task: Option<String>,
    consecutive_non_retryable: u32,
    iterations_since_progress: u32,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            same_task_trip: DEFAULT_SAME_TASK_TRIP,
            non_retryable_trip: DEFAULT_NON_RETRYABLE_TRIP,
            no_progress_trip: DEFAULT_NO_PROGRESS_TRIP,
            ring: VecDeque::new(),
            consecutive_same_task_failures: 0,
            last_failed_task: None,
            consecutive_non_retryable: 0,
            iterations_since_progress: 0,
        }
    }

    pub fn with_thresholds(ring_size: usize, same_task_trip: u32, non_retryable_trip: u32, no_progress_trip: u32) -> Self {
        Self {
            ring_size,
            same_task_trip,
            non_retryable_trip,
            no_progress_trip,
            ..Self::new()
        }
    }

    /// Record one iteration's outcome and report whether the breaker has
    /// now tripped.
    pub fn record(&mut self, outcome: IterationOutcome) -> Option<TripReason> {
        if self.ring.len() == self.ring_size {
            self.ring.pop_front();
        }

        if outcome.success {
            self.consecutive_same_task_failures = 0;
            self.last_failed_task = None;
            self.consecutive_non_retryable = 0;
            self.iterations_since_progress = 0;
            self.ring.push_back(outcome);
            return None;
        }

        self.iterations_since_progress += 1;

        if self.last_failed_task.as_deref() == Some(outcome.task_id.as_str()) {
            self.consecutive_same_task_failures += 1;
        } else {
            self.consecutive_same_task_failures = 1;
            self.last_failed_task = Some(outcome.task_id.clone());
        }

        if outcome.error_category.is_some_and(is_non_retryable) {
            self.consecutive_non_retryable += 1;
        } else {
            self.consecutive_non_retryable = 0;
        }

        self.ring.push_back(outcome);

        if self.consecutive_same_task_failures >= self.same_task_trip {
            return Some(TripReason::SameTaskFailures);
        }
        if self.consecutive_non_retryable >= self.non_retryable_trip {
            return Some(TripReason::NonRetryableFailures);
        }
        if self.iterations_since_progress >= self.no_progress_trip {
            return Some(TripReason::NoProgress);
        }
        None
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(task_id: &str, category: ErrorCategory) -> IterationOutcome {
        IterationOutcome { task_id: task_id.to_string(), success: false, error_category: Some(category) }
    }

    fn success(task_id: &str) -> IterationOutcome {
        IterationOutcome { task_id: task_id.to_string(), success: true, error_category: None }
    }

    #[test]
    fn trips_on_k_consecutive_same_task_failures() {
        let mut breaker = CircuitBreaker::new();
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
        assert_eq!(breaker.record(fail("t-1", ErrorCategory::ModelError)), Some(TripReason::SameTaskFailures));
    }

    #[test]
    fn different_tasks_reset_same_task_counter() {
        let mut breaker = CircuitBreaker::new();
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
        assert!(breaker.record(fail("t-2", ErrorCategory::ModelError)).is_none());
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
    }

    #[test]
    fn trips_on_non_retryable_category_across_tasks() {
        let mut breaker = CircuitBreaker::new();
        assert!(breaker.record(fail("t-1", ErrorCategory::Auth)).is_none());
        assert!(breaker.record(fail("t-2", ErrorCategory::Auth)).is_none());
        assert_eq!(breaker.record(fail("t-3", ErrorCategory::Auth)), Some(TripReason::NonRetryableFailures));
    }

    #[test]
    fn trips_on_no_progress_over_m_iterations() {
        let mut breaker = CircuitBreaker::with_thresholds(20, 100, 100, 3);
        assert!(breaker.record(fail("t-1", ErrorCategory::RateLimit)).is_none());
        assert!(breaker.record(fail("t-2", ErrorCategory::Network)).is_none());
        assert_eq!(breaker.record(fail("t-3", ErrorCategory::Timeout)), Some(TripReason::NoProgress));
    }

    #[test]
    fn successful_close_resets_the_breaker() {
        let mut breaker = CircuitBreaker::new();
        breaker.record(fail("t-1", ErrorCategory::ModelError));
        breaker.record(fail("t-1", ErrorCategory::ModelError));
        breaker.record(success("t-1"));
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
        assert!(breaker.record(fail("t-1", ErrorCategory::ModelError)).is_none());
    }

    #[test]
    fn transient_categories_do_not_count_as_non_retryable() {
        let mut breaker = CircuitBreaker::new();
        assert!(breaker.record(fail("t-1", ErrorCategory::RateLimit)).is_none());
        assert!(breaker.record(fail("t-2", ErrorCategory::RateLimit)).is_none());
        assert!(breaker.record(fail("t-3", ErrorCategory::RateLimit)).is_none());
    }
}
