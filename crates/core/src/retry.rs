//! Retry policy for failed processing attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(300);
/// Hard cap on the backoff exponent, so very large attempt counters
/// cannot overflow the doubling.
const MAX_EXPONENT_ATTEMPT: u32 = 10;

/// Retry policy configuration.
///
/// The delay for attempt `a` is `min(300s, base · 2^(clamp(a,1,10) − 1))`.
/// Purely exponential with a ceiling; no jitter is applied, so the
/// schedule is deterministic for a given attempt number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before the job fails terminally.
    pub max_attempts: u32,
    /// Exponential base delay.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
        }
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule: back to Pending, claimable after `delay`.
    Retry { delay: Duration, error: String },
    /// Terminal: the job becomes Failed with `error` recorded.
    GiveUp { error: String },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Decide the fate of a job whose `attempt`-th claim just failed.
    ///
    /// `attempt` is the job's attempt counter after the claim that
    /// failed (so the first failure arrives with `attempt = 1`).
    pub fn decide(&self, attempt: u32, error: impl Into<String>) -> RetryDecision {
        let error = error.into();
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp { error };
        }
        RetryDecision::Retry {
            delay: self.delay_for_attempt(attempt),
            error,
        }
    }

    /// The backoff delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let a = attempt.clamp(1, MAX_EXPONENT_ATTEMPT);
        let factor = 2u32.pow(a - 1);
        let delay = self.base_backoff.saturating_mul(factor);
        delay.min(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
    }

    #[test]
    fn delay_is_capped_at_five_minutes() {
        let policy = RetryPolicy::new(20, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
        // Exponent clamp: attempts past 10 keep the attempt-10 delay.
        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(300));
    }

    #[test]
    fn attempt_zero_is_clamped_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn formula_matches_for_all_small_attempts() {
        let base = 2u64;
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(base));
        for attempt in 0u32..=16 {
            let a = attempt.clamp(1, 10) as u64;
            let expected = (base * 2u64.pow(a as u32 - 1)).min(300);
            assert_eq!(
                policy.delay_for_attempt(attempt),
                Duration::from_secs(expected),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert!(matches!(policy.decide(1, "e"), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2, "e"), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(3, "e"), RetryDecision::GiveUp { .. }));
        assert!(matches!(policy.decide(4, "e"), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn retry_carries_error_and_delay() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        match policy.decide(2, "aggregation blew up") {
            RetryDecision::Retry { delay, error } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(error, "aggregation blew up");
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }
}
