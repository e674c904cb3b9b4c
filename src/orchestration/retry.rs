//! Retry scheduling for failed tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;

/// Exponential backoff with a cap: `base × 2^(attempt−1)`, at most `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_secs(config.base_backoff_seconds),
            max: Duration::from_secs(config.max_backoff_seconds),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a task that has already been retried `retry_count` times
    /// gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    /// When retry number `attempt` becomes due. A delay too large to
    /// represent makes the retry due immediately.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
