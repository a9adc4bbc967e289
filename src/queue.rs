use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::cache::{Cache, DiskCache, NoCache};
use crate::config::QueueConfig;
use crate::delivery::{DeliveryExecutor, ResponseDelivery, ThreadExecutor};
use crate::dispatch::{CacheDispatcher, DispatchQueue, NetworkDispatcher};
use crate::network::{Authenticator, Network, Transport};
use crate::request::{QueuedRequest, Request, RequestView};
use crate::retry::RetryPolicy;
use crate::util::lock_unpoisoned;

/// Owns the request lifecycle from [`add`](RequestQueue::add) to finish:
/// sequencing, routing between the cache and network tiers, in-flight
/// coalescing of duplicate cacheable requests, cancellation, and the
/// dispatcher threads themselves.
pub struct RequestQueue {
    core: Arc<QueueCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct QueueCore {
    sequence: AtomicU64,
    /// Every request admitted and not yet finished, keyed by sequence.
    current: Mutex<HashMap<u64, Arc<dyn QueuedRequest>>>,
    /// Cacheable requests parked behind an in-flight fetch for the same
    /// cache key. The key's presence alone marks a fetch as in flight.
    waiting: Mutex<HashMap<String, Vec<Arc<dyn QueuedRequest>>>>,
    cache_queue: Arc<DispatchQueue>,
    network_queue: Arc<DispatchQueue>,
    cache: Arc<dyn Cache>,
    network: Arc<Network>,
    delivery: Arc<ResponseDelivery>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn builder() -> RequestQueueBuilder {
        RequestQueueBuilder::new()
    }

    /// Spawns the cache dispatcher and the network dispatcher pool. Safe to
    /// call again after [`stop`](RequestQueue::stop).
    pub fn start(&self) {
        self.stop();
        self.core.cache_queue.open();
        self.core.network_queue.open();

        let mut workers = lock_unpoisoned(&self.workers);
        let cache_dispatcher = CacheDispatcher::new(
            Arc::clone(&self.core.cache_queue),
            Arc::clone(&self.core.network_queue),
            Arc::clone(&self.core.cache),
            Arc::clone(&self.core.delivery),
        );
        match cache_dispatcher.spawn() {
            Ok(handle) => workers.push(handle),
            Err(error) => warn!(%error, "failed to spawn cache dispatcher"),
        }
        for index in 0..self.core.config.network_threads {
            let network_dispatcher = NetworkDispatcher::new(
                Arc::clone(&self.core.network_queue),
                Arc::clone(&self.core.network),
                Arc::clone(&self.core.cache),
                Arc::clone(&self.core.delivery),
                index,
            );
            match network_dispatcher.spawn() {
                Ok(handle) => workers.push(handle),
                Err(error) => warn!(%error, index, "failed to spawn network dispatcher"),
            }
        }
        debug!(
            network_threads = self.core.config.network_threads,
            "request queue started"
        );
    }

    /// Closes both dispatch queues and joins every dispatcher. Requests
    /// still queued stay queued and run on the next `start`.
    pub fn stop(&self) {
        self.core.cache_queue.close();
        self.core.network_queue.close();
        let handles: Vec<_> = lock_unpoisoned(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Admits a request: assigns its sequence, routes it to the proper
    /// tier, and returns a shared handle for cancellation.
    pub fn add<T: Send + 'static>(&self, request: Request<T>) -> Arc<Request<T>> {
        let request = Arc::new(request);
        let erased: Arc<dyn QueuedRequest> = Arc::clone(&request) as Arc<dyn QueuedRequest>;
        self.core.add(erased);
        request
    }

    /// Cancels every in-flight request carrying `tag`.
    pub fn cancel_all_with_tag(&self, tag: &str) {
        self.cancel_all(|view| view.tag == Some(tag));
    }

    /// Cancels every in-flight request the predicate matches.
    pub fn cancel_all(&self, filter: impl Fn(RequestView<'_>) -> bool) {
        let current = lock_unpoisoned(&self.core.current);
        for request in current.values() {
            let network_request = request.network_request();
            let view = RequestView {
                method: &network_request.method,
                url: &network_request.url,
                tag: request.tag(),
                priority: request.priority(),
                sequence: request.sequence(),
            };
            if filter(view) {
                request.cancel();
            }
        }
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.core.cache)
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl QueueCore {
    fn add(self: &Arc<Self>, request: Arc<dyn QueuedRequest>) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        request.set_sequence(sequence);
        request.bind_queue(Arc::downgrade(self));
        request.apply_default_retry_policy(RetryPolicy::new(
            self.config.default_timeout,
            self.config.default_max_retries,
            self.config.default_backoff_multiplier,
        ));
        lock_unpoisoned(&self.current).insert(sequence, Arc::clone(&request));
        debug!(
            sequence,
            url = %request.network_request().url,
            "request admitted"
        );

        if !request.should_cache() {
            self.network_queue.push(request);
            return;
        }

        let key = request.cache_key();
        let mut waiting = lock_unpoisoned(&self.waiting);
        if let Some(parked) = waiting.get_mut(&key) {
            parked.push(request);
            debug!(%key, waiters = parked.len(), "request parked behind in-flight fetch");
        } else {
            waiting.insert(key, Vec::new());
            drop(waiting);
            self.cache_queue.push(request);
        }
    }

    /// Called by the request itself, exactly once, when its lifecycle
    /// ends. Re-admits any coalesced waiters so they observe the freshly
    /// written cache entry.
    pub(crate) fn finish(&self, sequence: u64, cache_key: &str, should_cache: bool) {
        lock_unpoisoned(&self.current).remove(&sequence);
        if !should_cache {
            return;
        }
        let released = lock_unpoisoned(&self.waiting).remove(cache_key);
        if let Some(waiters) = released {
            if !waiters.is_empty() {
                debug!(
                    key = cache_key,
                    count = waiters.len(),
                    "releasing coalesced waiters"
                );
            }
            for waiter in waiters {
                self.cache_queue.push(waiter);
            }
        }
    }
}

/// Assembles a [`RequestQueue`]. A transport is required unless the
/// `ureq-transport` feature (default) provides one; everything else has a
/// working default: no cache, a background delivery thread, no
/// authenticator.
pub struct RequestQueueBuilder {
    config: QueueConfig,
    cache: Option<Arc<dyn Cache>>,
    cache_dir: Option<PathBuf>,
    transport: Option<Arc<dyn Transport>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    delivery_executor: Option<Arc<dyn DeliveryExecutor>>,
}

impl RequestQueueBuilder {
    fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            cache: None,
            cache_dir: None,
            transport: None,
            authenticator: None,
            delivery_executor: None,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: impl Cache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn cache_arc(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shorthand for a [`DiskCache`] rooted at `dir` sized by the config.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn delivery_executor(mut self, executor: impl DeliveryExecutor + 'static) -> Self {
        self.delivery_executor = Some(Arc::new(executor));
        self
    }

    pub fn network_threads(mut self, network_threads: usize) -> Self {
        self.config = self.config.with_network_threads(network_threads);
        self
    }

    pub fn build(self) -> crate::Result<RequestQueue> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&self.config)?,
        };
        let cache: Arc<dyn Cache> = match (self.cache, self.cache_dir) {
            (Some(cache), _) => cache,
            (None, Some(dir)) => Arc::new(DiskCache::with_limits(
                dir,
                self.config.cache_max_size_bytes,
                self.config.cache_hysteresis_factor,
            )),
            (None, None) => Arc::new(NoCache),
        };
        let executor = self
            .delivery_executor
            .unwrap_or_else(|| Arc::new(ThreadExecutor::new()));
        let network = Network::new(
            transport,
            self.authenticator,
            self.config.slow_request_threshold,
        );

        Ok(RequestQueue {
            core: Arc::new(QueueCore {
                sequence: AtomicU64::new(0),
                current: Mutex::new(HashMap::new()),
                waiting: Mutex::new(HashMap::new()),
                cache_queue: Arc::new(DispatchQueue::new()),
                network_queue: Arc::new(DispatchQueue::new()),
                cache,
                network: Arc::new(network),
                delivery: Arc::new(ResponseDelivery::new(executor)),
                config: self.config,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(feature = "ureq-transport")]
fn default_transport(config: &QueueConfig) -> crate::Result<Arc<dyn Transport>> {
    let pool = Arc::new(crate::pool::ByteArrayPool::new(config.pool_max_bytes));
    Ok(Arc::new(crate::transport::UreqTransport::with_pool(pool)))
}

#[cfg(not(feature = "ureq-transport"))]
fn default_transport(_config: &QueueConfig) -> crate::Result<Arc<dyn Transport>> {
    Err(crate::error::Error::Config {
        message: "no transport configured and the ureq-transport feature is disabled".to_owned(),
    })
}
