//! Retry decisions and exponential backoff for step execution.
//!
//! Stateless: all logic lives in associated functions that take the step's
//! `RetryPolicy` as a parameter. The engine owns the attempt counter.

use std::time::Duration;

use conductor_types::workflow::RetryPolicy;

use super::error::StepError;

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should be made.
    ///
    /// `retries_done` counts retries already performed (0 after the first
    /// attempt fails).
    pub fn should_retry(policy: &RetryPolicy, retries_done: u32, error: &StepError) -> bool {
        error.is_retryable() && retries_done < policy.max_retries
    }

    /// Delay before retry `k` (1-based): `min(delay * multiplier^(k-1), max_delay)`.
    pub fn delay_for(policy: &RetryPolicy, k: u32) -> Duration {
        let exponent = k.saturating_sub(1) as i32;
        let multiplier = if policy.backoff_multiplier.is_finite() && policy.backoff_multiplier > 0.0 {
            policy.backoff_multiplier
        } else {
            1.0
        };
        let raw = policy.delay_ms as f64 * multiplier.powi(exponent);
        let capped = raw.min(policy.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_should_retry_counts() {
        let p = policy(3);
        let err = StepError::Execution("flaky".into());
        assert!(RetryHandler::should_retry(&p, 0, &err));
        assert!(RetryHandler::should_retry(&p, 2, &err));
        assert!(!RetryHandler::should_retry(&p, 3, &err));
    }

    #[test]
    fn test_no_retry_for_fatal_errors() {
        let p = policy(3);
        assert!(!RetryHandler::should_retry(&p, 0, &StepError::PermissionDenied("x".into())));
        assert!(!RetryHandler::should_retry(&p, 0, &StepError::BudgetExceeded("run".into())));
        assert!(!RetryHandler::should_retry(&p, 0, &StepError::CircuitOpen("a".into())));
        assert!(RetryHandler::should_retry(&p, 0, &StepError::Timeout(10)));
    }

    #[test]
    fn test_zero_retries() {
        assert!(!RetryHandler::should_retry(
            &RetryPolicy::none(),
            0,
            &StepError::Execution("x".into())
        ));
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let p = RetryPolicy {
            max_retries: 10,
            delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(RetryHandler::delay_for(&p, 1), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::delay_for(&p, 2), Duration::from_millis(2_000));
        assert_eq!(RetryHandler::delay_for(&p, 3), Duration::from_millis(4_000));
        assert_eq!(RetryHandler::delay_for(&p, 4), Duration::from_millis(5_000));
        assert_eq!(RetryHandler::delay_for(&p, 30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_constant_backoff() {
        let p = RetryPolicy {
            backoff_multiplier: 1.0,
            delay_ms: 250,
            ..RetryPolicy::default()
        };
        assert_eq!(RetryHandler::delay_for(&p, 5), Duration::from_millis(250));
    }
}
