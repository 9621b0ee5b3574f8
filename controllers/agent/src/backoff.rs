//! # Exponential Backoff
//!
//! Retry delays for pool status reconciliation: the first retry waits the
//! base delay, every further retry doubles it, and the sequence ends after a
//! fixed number of retries.

use std::time::Duration;

/// Base delay of pool status retries.
pub const POOL_RETRY_BASE: Duration = Duration::from_millis(5);
/// Retries before a pool status update is dropped.
pub const POOL_RETRY_ATTEMPTS: u32 = 15;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` that allows `max_attempts` retries
    #[must_use]
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    /// Backoff used by the pool status reconciler: 5ms, 10ms, 20ms, ... for 15 retries
    #[must_use]
    pub fn for_pool_status() -> Self {
        Self::new(POOL_RETRY_BASE, POOL_RETRY_ATTEMPTS)
    }

    /// Get the next delay and advance, or `None` once the retries are used up
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.base.saturating_mul(2u32.saturating_pow(self.attempts));
        self.attempts += 1;
        Some(delay)
    }

    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
