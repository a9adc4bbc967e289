use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use http::StatusCode;
use tracing::debug;

use crate::cache::Cache;
use crate::delivery::ResponseDelivery;
use crate::dispatch::DispatchQueue;
use crate::http::NetworkResponse;
use crate::request::QueuedRequest;
use crate::util::epoch_millis;

/// Single thread serving the cache queue. Misses and hard-expired hits go
/// on to the network queue; fresh hits are decoded and delivered here;
/// soft-expired hits are delivered immediately and then re-enqueued for
/// revalidation from the delivery executor's afterwork slot.
pub(crate) struct CacheDispatcher {
    cache_queue: Arc<DispatchQueue>,
    network_queue: Arc<DispatchQueue>,
    cache: Arc<dyn Cache>,
    delivery: Arc<ResponseDelivery>,
}

impl CacheDispatcher {
    pub(crate) fn new(
        cache_queue: Arc<DispatchQueue>,
        network_queue: Arc<DispatchQueue>,
        cache: Arc<dyn Cache>,
        delivery: Arc<ResponseDelivery>,
    ) -> Self {
        Self {
            cache_queue,
            network_queue,
            cache,
            delivery,
        }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("fetchq-cache".to_owned())
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!("cache dispatcher started");
        self.cache.initialize();
        while let Some(request) = self.cache_queue.take() {
            self.process(request);
        }
        debug!("cache dispatcher stopped");
    }

    fn process(&self, request: Arc<dyn QueuedRequest>) {
        if request.is_canceled() {
            request.finish("cache-discard-canceled");
            return;
        }
        let key = request.cache_key();
        let Some(entry) = self.cache.get(&key) else {
            debug!(%key, "cache miss");
            self.network_queue.push(request);
            return;
        };

        let now = epoch_millis();
        if entry.is_expired(now) {
            debug!(%key, "cache hit expired");
            request.set_cache_entry(entry);
            self.network_queue.push(request);
            return;
        }

        let cached_response = NetworkResponse::new(
            StatusCode::OK,
            entry.data.clone(),
            entry.response_headers.clone(),
        );
        let deliver = match Arc::clone(&request).decode(&cached_response) {
            Ok(deliver) => deliver,
            Err(error) => {
                self.delivery.post_error(request, error);
                return;
            }
        };

        if entry.refresh_needed(now) {
            debug!(%key, "cache hit needs refresh");
            request.set_cache_entry(entry);
            request.mark_delivered();
            let network_queue = Arc::clone(&self.network_queue);
            let revalidate = Arc::clone(&request);
            self.delivery.post_response(
                request,
                deliver,
                true,
                Some(Box::new(move || network_queue.push(revalidate))),
            );
        } else {
            debug!(%key, "cache hit");
            request.mark_delivered();
            self.delivery.post_response(request, deliver, false, None);
        }
    }
}
