use std::time::Duration;

use crate::pool::DEFAULT_POOL_MAX_BYTES;
use crate::retry;

pub const DEFAULT_NETWORK_THREADS: usize = 4;
pub const DEFAULT_CACHE_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_CACHE_HYSTERESIS_FACTOR: f32 = 0.9;
pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(3);

/// Tunables for a [`RequestQueue`](crate::RequestQueue). Collaborator
/// objects (cache, transport, authenticator, delivery executor) are wired
/// through the queue builder instead.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Network dispatcher count.
    pub network_threads: usize,
    /// Disk cache budget in bytes.
    pub cache_max_size_bytes: usize,
    /// Eviction target ratio: pruning stops once the cache fits within
    /// `cache_max_size_bytes * cache_hysteresis_factor`.
    pub cache_hysteresis_factor: f32,
    /// Byte-buffer pool budget for response body copying.
    pub pool_max_bytes: usize,
    /// Attempts slower than this are logged.
    pub slow_request_threshold: Duration,
    /// Initial per-attempt timeout for requests without an explicit policy.
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub default_backoff_multiplier: f32,
}

impl QueueConfig {
    pub fn with_network_threads(mut self, network_threads: usize) -> Self {
        self.network_threads = network_threads.max(1);
        self
    }

    pub fn with_cache_max_size_bytes(mut self, cache_max_size_bytes: usize) -> Self {
        self.cache_max_size_bytes = cache_max_size_bytes;
        self
    }

    pub fn with_cache_hysteresis_factor(mut self, cache_hysteresis_factor: f32) -> Self {
        self.cache_hysteresis_factor = cache_hysteresis_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_pool_max_bytes(mut self, pool_max_bytes: usize) -> Self {
        self.pool_max_bytes = pool_max_bytes;
        self
    }

    pub fn with_slow_request_threshold(mut self, slow_request_threshold: Duration) -> Self {
        self.slow_request_threshold = slow_request_threshold;
        self
    }

    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_default_max_retries(mut self, default_max_retries: u32) -> Self {
        self.default_max_retries = default_max_retries;
        self
    }

    pub fn with_default_backoff_multiplier(mut self, default_backoff_multiplier: f32) -> Self {
        self.default_backoff_multiplier = default_backoff_multiplier.max(0.0);
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            network_threads: DEFAULT_NETWORK_THREADS,
            cache_max_size_bytes: DEFAULT_CACHE_MAX_SIZE_BYTES,
            cache_hysteresis_factor: DEFAULT_CACHE_HYSTERESIS_FACTOR,
            pool_max_bytes: DEFAULT_POOL_MAX_BYTES,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
            default_timeout: retry::DEFAULT_TIMEOUT,
            default_max_retries: retry::DEFAULT_MAX_RETRIES,
            default_backoff_multiplier: retry::DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}
