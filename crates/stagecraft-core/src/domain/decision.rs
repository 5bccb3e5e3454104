//! Decision model: what to do with a task whose stage returned an error.
//!
//! This module defines the Decision type (what to do next) and the Decider
//! trait (how to decide it from the task record and the stage error).
//! Applying a decision is the failure manager's job.

use super::errors::StageError;
use super::task::TaskRecord;

/// The next action for a task after its stage returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Put the task back to pending so the claim engine picks it up again.
    Retry { reason: String },

    /// Fail permanently and cancel every dependent.
    Fail { reason: String },

    /// Fail permanently, cancel the project's remaining same-stage tasks and
    /// raise a quota alert.
    FailFatal { reason: String },

    /// The stage was cancelled. Terminal, never retried, no cascade.
    Cancel,
}

/// Trait for deciding the next action for a failed attempt.
///
/// Deciders are pure functions: given the task record (attempts already
/// include the failed attempt) and the error, they return the next action
/// without side effects.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, error: &StageError) -> Decision;
}

/// Default decider.
///
/// - Quota errors are fatal.
/// - Permanent errors fail immediately.
/// - Transient errors retry while attempts < max_attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecider;

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, error: &StageError) -> Decision {
        match error {
            StageError::Cancelled => Decision::Cancel,
            StageError::Quota { message, .. } => Decision::FailFatal {
                reason: format!("quota exhausted: {message}"),
            },
            StageError::Permanent { message, .. } => Decision::Fail {
                reason: format!("permanent error: {message}"),
            },
            StageError::Transient { message, .. } if task.has_exhausted_attempts() => {
                Decision::Fail {
                    reason: format!(
                        "max attempts reached ({}/{}): {message}",
                        task.attempts, task.max_attempts
                    ),
                }
            }
            StageError::Transient { message, .. } => Decision::Retry {
                reason: format!(
                    "retry attempt {}/{}: {message}",
                    task.attempts + 1,
                    task.max_attempts
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageType;
    use crate::domain::task::fixtures::new_task;
    use chrono::Utc;
    use rstest::rstest;

    fn task_with_attempts(attempts: u32, max_attempts: u32) -> TaskRecord {
        let mut record = TaskRecord::new(new_task("p", StageType::Images), Utc::now());
        record.attempts = attempts;
        record.max_attempts = max_attempts;
        record
    }

    #[rstest]
    #[case::first_failure(1, 3, true)]
    #[case::second_failure(2, 3, true)]
    #[case::exhausted(3, 3, false)]
    #[case::over_budget(4, 3, false)]
    #[case::single_shot(1, 1, false)]
    fn transient_errors_retry_until_exhausted(
        #[case] attempts: u32,
        #[case] max_attempts: u32,
        #[case] retries: bool,
    ) {
        let decision =
            DefaultDecider.decide(&task_with_attempts(attempts, max_attempts), &StageError::transient("timeout"));
        assert_eq!(matches!(decision, Decision::Retry { .. }), retries);
        assert_eq!(matches!(decision, Decision::Fail { .. }), !retries);
    }

    #[test]
    fn quota_errors_are_fatal_even_with_attempts_left() {
        let decision = DefaultDecider.decide(&task_with_attempts(1, 5), &StageError::quota("no credits"));
        assert!(matches!(decision, Decision::FailFatal { .. }));
    }

    #[test]
    fn permanent_errors_never_retry() {
        let decision =
            DefaultDecider.decide(&task_with_attempts(1, 5), &StageError::permanent("bad input"));
        assert!(matches!(decision, Decision::Fail { .. }));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let decision = DefaultDecider.decide(&task_with_attempts(1, 5), &StageError::Cancelled);
        assert_eq!(decision, Decision::Cancel);
    }
}
