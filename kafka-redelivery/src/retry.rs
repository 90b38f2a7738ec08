//! # Retry
//!
//! Backoff between redelivery attempts of a halted partition.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy to determine how long a halted partition waits before its
/// failing record is redelivered.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Redeliver on the very next poll cycle, without waiting.
    pub fn immediate() -> Self {
        RetryPolicy {
            backoff_coefficient: 1,
            initial_interval: time::Duration::ZERO,
            maximum_interval: None,
        }
    }

    /// Determine interval for retrying at a given attempt number (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let multiplier = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self.initial_interval.saturating_mul(multiplier);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(30)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 100; "first attempt uses initial interval")]
    #[test_case(2, 200; "second attempt doubles")]
    #[test_case(3, 400; "third attempt doubles again")]
    #[test_case(10, 1000; "capped at maximum")]
    fn test_retry_interval_with_maximum(attempt: u32, expected_ms: u64) {
        let policy = RetryPolicy::build(2, time::Duration::from_millis(100))
            .maximum_interval(time::Duration::from_secs(1))
            .provide();

        assert_eq!(
            policy.retry_interval(attempt),
            time::Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_retry_interval_never_overflows() {
        let policy = RetryPolicy {
            backoff_coefficient: 10,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        };

        // the multiplier saturates at u32::MAX instead of panicking
        assert_eq!(
            policy.retry_interval(u32::MAX),
            time::Duration::from_secs(u64::from(u32::MAX))
        );
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.retry_interval(1), time::Duration::ZERO);
        assert_eq!(policy.retry_interval(50), time::Duration::ZERO);
    }
}
