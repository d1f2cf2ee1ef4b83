//! How many times a chunk may be attempted and how long to wait in between.

use std::time::Duration;

/// Retry policy applied to each chunk independently.
///
/// The default retries forever with no delay and discards stale input before
/// every retry, which is what the target firmware expects from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum transactions per chunk, or `None` for no limit.
    pub max_attempts: Option<u32>,
    /// Delay before each retry.
    pub backoff: Duration,
    /// Drop unread input before each retry.
    pub clear_on_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
            clear_on_retry: true,
        }
    }
}

impl RetryPolicy {
    /// Give up after `max_attempts` transactions on one chunk.
    ///
    /// Zero is treated as one; every chunk is attempted at least once.
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..Self::default()
        }
    }

    /// Set the delay before each retry.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set whether stale input is discarded before a retry.
    #[must_use]
    pub fn with_clear_on_retry(mut self, clear: bool) -> Self {
        self.clear_on_retry = clear;
        self
    }

    /// Whether another transaction may follow `attempts` failed ones.
    pub fn allows_another(&self, attempts: u32) -> bool {
        self.max_attempts
            .is_none_or(|max| attempts < max)
    }
}
