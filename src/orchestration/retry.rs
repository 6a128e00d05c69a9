//! # Retry Policy
//!
//! Decides whether a failed attempt gets another try and how long to wait
//! before it. Delays come from a fixed table (`retry.backoff_seconds`): the
//! delay before attempt `n + 1` is entry `n - 1`, and the last entry repeats
//! once the table runs out.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::constants::defaults;
use crate::error::ErrorKind;

/// What the executor does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            defaults::MAX_ATTEMPTS,
            defaults::BACKOFF_SECONDS
                .iter()
                .map(|seconds| Duration::from_secs(*seconds))
                .collect(),
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .backoff_seconds
                .iter()
                .map(|seconds| Duration::from_secs(*seconds))
                .collect(),
        )
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decide what follows a failed `attempt` (1-based) of kind `kind`
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() || self.is_final_attempt(attempt) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_after(attempt))
    }

    /// Whether `attempt` (1-based) exhausts the attempt budget
    pub fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, ErrorKind::ConnectionError),
            RetryDecision::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(
            policy.decide(2, ErrorKind::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(180))
        );
        assert_eq!(policy.decide(3, ErrorKind::ConnectionError), RetryDecision::GiveUp);
    }

    #[test]
    fn test_permanent_kinds_never_retry() {
        let policy = RetryPolicy::default();
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Duplicate,
            ErrorKind::UnsupportedErpType,
            ErrorKind::ConnectionNotFound,
            ErrorKind::MemoryLimit,
        ] {
            assert_eq!(policy.decide(1, kind), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_last_delay_repeats() {
        let policy = RetryPolicy::new(6, vec![Duration::from_secs(60), Duration::from_secs(180), Duration::from_secs(600)]);
        assert_eq!(policy.delay_after(3), Duration::from_secs(600));
        assert_eq!(policy.delay_after(5), Duration::from_secs(600));
        assert!(policy.is_final_attempt(6));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 2,
            backoff_seconds: vec![5],
        });
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(
            policy.decide(1, ErrorKind::Internal),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(RetryPolicy::no_retry().decide(1, ErrorKind::Timeout), RetryDecision::GiveUp);
    }
}
