//! Retry policy for failed saves.
//!
//! Backoff uses fixed formulas (no jitter) so paused-clock tests can assert
//! exact schedules.
//!
//! ```
//! use draftsync_engine::retry::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.delay(1), Duration::from_secs(2));
//! assert_eq!(policy.delay(3), Duration::from_secs(8));
//! ```

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^attempt`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = fail on first error).
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential {
                base_ms: 1_000,
                max_ms: 60_000,
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::Fixed { delay_ms: 0 },
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(multiplier).min(*max_ms))
            }
        }
    }

    /// Whether another retry is allowed after `attempts_made` retries.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=3).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn exponential_is_capped() {
        let policy = RetryPolicy::new(
            10,
            BackoffStrategy::Exponential {
                base_ms: 1_000,
                max_ms: 5_000,
            },
        );
        assert_eq!(policy.delay(9), Duration::from_millis(5_000));
        assert_eq!(policy.delay(200), Duration::from_millis(5_000));
    }

    #[test]
    fn budget_counts_retries_not_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!RetryPolicy::no_retry().allows(0));
    }
}
