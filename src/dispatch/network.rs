use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::cache::Cache;
use crate::delivery::ResponseDelivery;
use crate::dispatch::DispatchQueue;
use crate::headers::parse_cache_headers;
use crate::network::Network;
use crate::request::QueuedRequest;

/// One worker in the fixed-size pool serving the network queue: performs
/// the transport retry loop, decodes on this thread, writes the cache
/// entry, and posts the outcome.
pub(crate) struct NetworkDispatcher {
    network_queue: Arc<DispatchQueue>,
    network: Arc<Network>,
    cache: Arc<dyn Cache>,
    delivery: Arc<ResponseDelivery>,
    index: usize,
}

impl NetworkDispatcher {
    pub(crate) fn new(
        network_queue: Arc<DispatchQueue>,
        network: Arc<Network>,
        cache: Arc<dyn Cache>,
        delivery: Arc<ResponseDelivery>,
        index: usize,
    ) -> Self {
        Self {
            network_queue,
            network,
            cache,
            delivery,
            index,
        }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("fetchq-net-{}", self.index))
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!(index = self.index, "network dispatcher started");
        while let Some(request) = self.network_queue.take() {
            self.process(request);
        }
        debug!(index = self.index, "network dispatcher stopped");
    }

    fn process(&self, request: Arc<dyn QueuedRequest>) {
        if request.is_canceled() {
            request.finish("network-discard-canceled");
            return;
        }
        match self.network.perform_request(request.as_ref()) {
            Ok(response) => {
                // A 304 against data we already served from the cache needs
                // no second delivery.
                if response.not_modified && request.was_delivered() {
                    request.finish("not-modified");
                    return;
                }
                let deliver = match Arc::clone(&request).decode(&response) {
                    Ok(deliver) => deliver,
                    Err(error) => {
                        self.delivery.post_error(request, error);
                        return;
                    }
                };
                if request.should_cache() {
                    if let Some(entry) = parse_cache_headers(&response) {
                        self.cache.put(&request.cache_key(), entry);
                    }
                }
                request.mark_delivered();
                self.delivery.post_response(request, deliver, false, None);
            }
            Err(error) => {
                self.delivery.post_error(request, error);
            }
        }
    }
}
