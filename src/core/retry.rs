use std::time::Duration;

use crate::error::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// Per-request timeout and attempt budget. The current timeout grows by
/// `backoff_multiplier` on every consumed retry and is applied by the
/// transport on the next attempt.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    current_timeout: Duration,
    current_retry_count: u32,
    backoff_multiplier: f32,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(initial_timeout: Duration, max_retries: u32, backoff_multiplier: f32) -> Self {
        Self {
            current_timeout: initial_timeout.max(Duration::from_millis(1)),
            current_retry_count: 0,
            backoff_multiplier: backoff_multiplier.max(0.0),
            max_retries,
        }
    }

    /// A policy that never retries; the first failure is final.
    pub fn none(initial_timeout: Duration) -> Self {
        Self::new(initial_timeout, 0, DEFAULT_BACKOFF_MULTIPLIER)
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.current_retry_count
    }

    /// Consumes one retry attempt. Returns `error` back when the budget is
    /// already spent; the caller rethrows it as the final outcome.
    pub(crate) fn retry(&mut self, error: Error) -> Result<(), Error> {
        if self.current_retry_count + 1 > self.max_retries {
            return Err(error);
        }
        self.current_retry_count += 1;
        self.current_timeout += self.current_timeout.mul_f32(self.backoff_multiplier);
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_MULTIPLIER)
    }
}
