//! Retry policy for failed node attempts.
//!
//! Stateless: the node runner owns the retry counter and asks the policy
//! whether another attempt is allowed and how long to back off first.

use std::time::Duration;

use conductor_types::config::BackoffConfig;

/// Exponential backoff: `min(cap, base * 2^retry_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Whether a node that has already retried `retry_count` times may retry again.
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Delay before the retry following `retry_count` previous retries.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for RetryPolicy {
    fn from(config: BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.cap_ms),
        )
    }
}
