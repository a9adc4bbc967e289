use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::Entry;
use crate::converter::{
    BytesConverter, ConvertError, FormBody, JsonBody, JsonConverter, RequestConverter,
    ResponseConverter, StringConverter,
};
use crate::error::Error;
use crate::http::{NetworkRequest, NetworkResponse};
use crate::queue::QueueCore;
use crate::retry::RetryPolicy;
use crate::util::lock_unpoisoned;

/// Dispatch priority. Requests with equal priority are served in admission
/// order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// Success/error callback pair invoked on the delivery executor. The
/// success side can fire twice for one request: once with soft-expired
/// cache data and once more if a refresh brings back changed data.
struct Listener<T> {
    on_response: Option<Box<dyn Fn(T) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
}

/// A typed unit of work: addressing, priority, cacheability, converter,
/// and listeners. Submit via [`RequestQueue::add`](crate::RequestQueue::add),
/// which returns a handle usable for [`cancel`](Request::cancel).
pub struct Request<T> {
    network_request: NetworkRequest,
    priority: Priority,
    tag: Option<String>,
    should_cache: bool,
    cache_key_override: Option<String>,
    converter: Box<dyn ResponseConverter<T>>,
    listener: Listener<T>,
    retry_policy: Mutex<RetryPolicy>,
    explicit_retry_policy: bool,
    cache_entry: Mutex<Option<Entry>>,
    sequence: AtomicU64,
    canceled: AtomicBool,
    delivered: AtomicBool,
    queue: Mutex<Option<Weak<QueueCore>>>,
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("network_request", &self.network_request)
            .field("priority", &self.priority)
            .field("tag", &self.tag)
            .field("should_cache", &self.should_cache)
            .field("cache_key_override", &self.cache_key_override)
            .field("retry_policy", &self.retry_policy)
            .field("explicit_retry_policy", &self.explicit_retry_policy)
            .field("cache_entry", &self.cache_entry)
            .field("sequence", &self.sequence)
            .field("canceled", &self.canceled)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

const SEQUENCE_UNSET: u64 = u64::MAX;

impl<T> Request<T> {
    pub fn builder(
        method: Method,
        url: impl Into<String>,
        converter: impl ResponseConverter<T> + 'static,
    ) -> RequestBuilder<T> {
        RequestBuilder::new(method, url.into(), Box::new(converter))
    }

    pub fn method(&self) -> &Method {
        &self.network_request.method
    }

    pub fn url(&self) -> &str {
        &self.network_request.url
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Cache key; method plus URL unless overridden at build time.
    /// Requests with the same key coalesce onto one fetch.
    pub fn cache_key(&self) -> String {
        match &self.cache_key_override {
            Some(key) => key.clone(),
            None => format!("{} {}", self.network_request.method, self.network_request.url),
        }
    }

    /// Flags the request so delivery is suppressed. In-flight transport is
    /// not aborted; its result is dropped at the delivery gate.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

impl Request<Bytes> {
    /// Raw-bytes request.
    pub fn bytes(method: Method, url: impl Into<String>) -> RequestBuilder<Bytes> {
        Request::builder(method, url, BytesConverter)
    }
}

impl Request<String> {
    /// Charset-aware text request.
    pub fn string(method: Method, url: impl Into<String>) -> RequestBuilder<String> {
        Request::builder(method, url, StringConverter)
    }
}

impl<T> Request<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// JSON-decoded request.
    pub fn json(method: Method, url: impl Into<String>) -> RequestBuilder<T> {
        Request::builder(method, url, JsonConverter::new())
    }
}

pub struct RequestBuilder<T> {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    priority: Priority,
    tag: Option<String>,
    should_cache: Option<bool>,
    cache_key: Option<String>,
    retry_policy: Option<RetryPolicy>,
    converter: Box<dyn ResponseConverter<T>>,
    on_response: Option<Box<dyn Fn(T) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
}

impl<T> RequestBuilder<T> {
    fn new(method: Method, url: String, converter: Box<dyn ResponseConverter<T>>) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            priority: Priority::default(),
            tag: None,
            should_cache: None,
            cache_key: None,
            retry_policy: None,
            converter,
            on_response: None,
            on_error: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let name = HeaderName::try_from(name).map_err(|_| Error::Config {
            message: format!("invalid header name: {name}"),
        })?;
        let value = HeaderValue::try_from(value).map_err(|_| Error::Config {
            message: format!("invalid value for header {name}"),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Overrides the cacheability default (GET caches, everything else
    /// does not).
    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = Some(should_cache);
        self
    }

    /// Replaces the `"METHOD url"` cache key, for requests whose identity
    /// includes more than the URL (a decode size, for instance).
    pub fn cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn body(mut self, data: impl Into<Bytes>, content_type: HeaderValue) -> Self {
        self.body = Some(data.into());
        self.headers.insert(CONTENT_TYPE, content_type);
        self
    }

    pub fn body_with<U>(
        mut self,
        converter: &impl RequestConverter<U>,
        value: &U,
    ) -> Result<Self, ConvertError> {
        let encoded = converter.convert(value)?;
        self.body = Some(encoded.data);
        self.headers.insert(CONTENT_TYPE, encoded.content_type);
        Ok(self)
    }

    pub fn json_body<U: Serialize>(self, value: &U) -> Result<Self, ConvertError> {
        self.body_with(&JsonBody, value)
    }

    pub fn form_body<U: Serialize>(self, value: &U) -> Result<Self, ConvertError> {
        self.body_with(&FormBody, value)
    }

    pub fn on_response(mut self, on_response: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_response = Some(Box::new(on_response));
        self
    }

    pub fn on_error(mut self, on_error: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Validates the URL and produces the request. A URL the `url` crate
    /// rejects never reaches a dispatcher.
    pub fn build(self) -> crate::Result<Request<T>> {
        if url::Url::parse(&self.url).is_err() {
            return Err(Error::BadUrl { url: self.url });
        }
        let should_cache = self
            .should_cache
            .unwrap_or(self.method == Method::GET);
        let network_request = NetworkRequest {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
        };
        Ok(Request {
            network_request,
            priority: self.priority,
            tag: self.tag,
            should_cache,
            cache_key_override: self.cache_key,
            converter: self.converter,
            listener: Listener {
                on_response: self.on_response,
                on_error: self.on_error,
            },
            explicit_retry_policy: self.retry_policy.is_some(),
            retry_policy: Mutex::new(self.retry_policy.unwrap_or_default()),
            cache_entry: Mutex::new(None),
            sequence: AtomicU64::new(SEQUENCE_UNSET),
            canceled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            queue: Mutex::new(None),
        })
    }
}

/// Closure that invokes the success listener with an already-decoded
/// value; built on a dispatcher thread, run on the delivery executor.
pub(crate) type DeliverFn = Box<dyn FnOnce() + Send>;

/// Type-erased view of a [`Request`] as the queue and dispatchers see it.
pub(crate) trait QueuedRequest: Send + Sync {
    fn sequence(&self) -> u64;
    fn set_sequence(&self, sequence: u64);
    fn priority(&self) -> Priority;
    fn network_request(&self) -> &NetworkRequest;
    fn cache_key(&self) -> String;
    fn tag(&self) -> Option<&str>;
    fn should_cache(&self) -> bool;
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
    fn mark_delivered(&self);
    fn was_delivered(&self) -> bool;
    fn cache_entry(&self) -> Option<Entry>;
    fn set_cache_entry(&self, entry: Entry);
    fn current_timeout(&self) -> Duration;
    fn retry_count(&self) -> u32;
    /// Consumes one retry from the request's policy, growing its timeout.
    fn retry(&self, error: Error) -> Result<(), Error>;
    /// Installs the queue's default policy unless the caller set one
    /// explicitly. Invoked once at admission.
    fn apply_default_retry_policy(&self, policy: RetryPolicy);
    fn bind_queue(&self, queue: Weak<QueueCore>);
    /// Notifies the owning queue exactly once; later calls are no-ops.
    fn finish(&self, reason: &'static str);
    /// Runs the response converter now and returns the listener invocation
    /// for the delivery executor.
    fn decode(self: Arc<Self>, response: &NetworkResponse) -> Result<DeliverFn, Error>;
    fn invoke_error_listener(&self, error: &Error);
}

impl<T> QueuedRequest for Request<T>
where
    T: Send + 'static,
{
    fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn network_request(&self) -> &NetworkRequest {
        &self.network_request
    }

    fn cache_key(&self) -> String {
        Request::cache_key(self)
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn should_cache(&self) -> bool {
        self.should_cache
    }

    fn cancel(&self) {
        Request::cancel(self);
    }

    fn is_canceled(&self) -> bool {
        Request::is_canceled(self)
    }

    fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::SeqCst);
    }

    fn was_delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    fn cache_entry(&self) -> Option<Entry> {
        lock_unpoisoned(&self.cache_entry).clone()
    }

    fn set_cache_entry(&self, entry: Entry) {
        *lock_unpoisoned(&self.cache_entry) = Some(entry);
    }

    fn current_timeout(&self) -> Duration {
        lock_unpoisoned(&self.retry_policy).current_timeout()
    }

    fn retry_count(&self) -> u32 {
        lock_unpoisoned(&self.retry_policy).retry_count()
    }

    fn retry(&self, error: Error) -> Result<(), Error> {
        lock_unpoisoned(&self.retry_policy).retry(error)
    }

    fn apply_default_retry_policy(&self, policy: RetryPolicy) {
        if !self.explicit_retry_policy {
            *lock_unpoisoned(&self.retry_policy) = policy;
        }
    }

    fn bind_queue(&self, queue: Weak<QueueCore>) {
        *lock_unpoisoned(&self.queue) = Some(queue);
    }

    fn finish(&self, reason: &'static str) {
        let bound = lock_unpoisoned(&self.queue).take();
        if let Some(queue) = bound.and_then(|weak| weak.upgrade()) {
            debug!(sequence = self.sequence(), reason, "request finished");
            queue.finish(self.sequence(), &Request::cache_key(self), self.should_cache);
        }
    }

    fn decode(self: Arc<Self>, response: &NetworkResponse) -> Result<DeliverFn, Error> {
        match self.converter.convert(response) {
            Ok(value) => {
                let request = Arc::clone(&self);
                Ok(Box::new(move || {
                    if let Some(on_response) = &request.listener.on_response {
                        on_response(value);
                    }
                }))
            }
            Err(error) => Err(Error::Parse {
                message: error.to_string(),
                network_time_ms: response.network_time_ms,
            }),
        }
    }

    fn invoke_error_listener(&self, error: &Error) {
        if let Some(on_error) = &self.listener.on_error {
            on_error(error);
        }
    }
}

/// Read-only facts about an in-flight request, handed to
/// [`cancel_all`](crate::RequestQueue::cancel_all) predicates.
#[derive(Clone, Copy, Debug)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub tag: Option<&'a str>,
    pub priority: Priority,
    pub sequence: u64,
}
