use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use fetchq::{
    Cache, Entry, ImmediateExecutor, NetworkRequest, Priority, RawResponse, Request, RequestQueue,
    RetryPolicy, Transport, TransportError,
};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as u64
}

#[derive(Clone, Debug)]
struct CapturedCall {
    url: String,
    headers: HeaderMap,
}

/// Transport that replays a script of canned outcomes and records every
/// attempt it sees. Optionally holds its first call open until released,
/// to keep a single network dispatcher busy.
struct MockTransport {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    calls: Mutex<Vec<CapturedCall>>,
    gate: Option<CallGate>,
}

struct CallGate {
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl MockTransport {
    fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    /// As `new`, but the first call blocks until `release` fires;
    /// `entered` reports that the worker reached the transport.
    fn gated(
        script: Vec<Result<RawResponse, TransportError>>,
        entered: Sender<()>,
        release: Receiver<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            gate: Some(CallGate {
                entered,
                release: Mutex::new(release),
            }),
        })
    }

    fn calls(&self) -> Vec<CapturedCall> {
        self.calls.lock().expect("lock calls").clone()
    }
}

impl Transport for MockTransport {
    fn perform(
        &self,
        request: &NetworkRequest,
        extra_headers: &HeaderMap,
        _timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let call_index = {
            let mut calls = self.calls.lock().expect("lock calls");
            let mut headers = request.headers.clone();
            for (name, value) in extra_headers {
                headers.insert(name.clone(), value.clone());
            }
            calls.push(CapturedCall {
                url: request.url.clone(),
                headers,
            });
            calls.len() - 1
        };

        if call_index == 0 {
            if let Some(gate) = &self.gate {
                gate.entered.send(()).expect("report transport entry");
                gate.release
                    .lock()
                    .expect("lock release receiver")
                    .recv()
                    .expect("wait for release");
            }
        }

        self.script
            .lock()
            .expect("lock script")
            .pop_front()
            .unwrap_or_else(|| Ok(ok_response(b"fallback", &[])))
    }
}

fn ok_response(body: &[u8], headers: &[(&str, &str)]) -> RawResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::try_from(*name).expect("valid header name"),
            HeaderValue::try_from(*value).expect("valid header value"),
        );
    }
    RawResponse {
        status: StatusCode::OK,
        headers: map,
        data: Bytes::copy_from_slice(body),
    }
}

fn status_response(status: StatusCode) -> RawResponse {
    RawResponse {
        status,
        headers: HeaderMap::new(),
        data: Bytes::new(),
    }
}

fn fresh_entry(body: &[u8], soft_ttl: u64, ttl: u64, etag: Option<&str>) -> Entry {
    Entry {
        data: Bytes::copy_from_slice(body),
        etag: etag.map(str::to_owned),
        server_date: epoch_millis(),
        last_modified: 0,
        ttl,
        soft_ttl,
        response_headers: HeaderMap::new(),
    }
}

fn queue_with(transport: Arc<MockTransport>, cache_dir: &std::path::Path) -> RequestQueue {
    RequestQueue::builder()
        .transport_arc(transport)
        .cache_dir(cache_dir)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds")
}

struct Delivered {
    bodies: Receiver<Bytes>,
    errors: Receiver<String>,
}

fn observed_request(
    method: Method,
    url: &str,
) -> (fetchq::RequestBuilder<Bytes>, Delivered) {
    let (body_tx, bodies) = mpsc::channel();
    let (error_tx, errors) = mpsc::channel();
    let builder = Request::bytes(method, url)
        .on_response(move |body| {
            body_tx.send(body).expect("report delivery");
        })
        .on_error(move |error| {
            error_tx.send(error.code().as_str().to_owned()).expect("report error");
        });
    (builder, Delivered { bodies, errors })
}

fn assert_no_more(receiver: &Receiver<Bytes>) {
    match receiver.recv_timeout(Duration::from_millis(300)) {
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        Ok(extra) => panic!("unexpected extra delivery of {} bytes", extra.len()),
    }
}

#[test]
fn fresh_cache_hit_skips_the_network() {
    let transport = MockTransport::new(Vec::new());
    let cache_dir = tempfile::tempdir().expect("create temp dir");
    let queue = queue_with(Arc::clone(&transport), cache_dir.path());

    let url = "https://api.test/v1/fresh";
    let now = epoch_millis();
    queue.cache().put(
        &format!("GET {url}"),
        fresh_entry(b"cached-bytes", now + 60_000, now + 60_000, None),
    );

    queue.start();
    let (builder, delivered) = observed_request(Method::GET, url);
    queue.add(builder.build().expect("request builds"));

    let body = delivered
        .bodies
        .recv_timeout(RECV_TIMEOUT)
        .expect("fresh hit delivers");
    assert_eq!(body.as_ref(), b"cached-bytes");
    assert_no_more(&delivered.bodies);
    assert!(transport.calls().is_empty(), "fresh hit must not touch the network");
    queue.stop();
}

#[test]
fn soft_expired_hit_serves_and_revalidates_once() {
    let transport = MockTransport::new(vec![Ok(status_response(StatusCode::NOT_MODIFIED))]);
    let cache_dir = tempfile::tempdir().expect("create temp dir");
    let queue = queue_with(Arc::clone(&transport), cache_dir.path());

    let url = "https://api.test/v1/stale";
    let now = epoch_millis();
    queue.cache().put(
        &format!("GET {url}"),
        fresh_entry(b"stale-bytes", now - 1_000, now + 60_000, Some("W/\"v1\"")),
    );

    queue.start();
    let (builder, delivered) = observed_request(Method::GET, url);
    queue.add(builder.build().expect("request builds"));

    let body = delivered
        .bodies
        .recv_timeout(RECV_TIMEOUT)
        .expect("stale hit delivers immediately");
    assert_eq!(body.as_ref(), b"stale-bytes");

    // Revalidation happens in the background; wait for the transport call.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while transport.calls().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let calls = transport.calls();
    assert_eq!(calls.len(), 1, "exactly one revalidation fetch");
    assert_eq!(
        calls[0]
            .headers
            .get(http::header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok()),
        Some("W/\"v1\"")
    );
    assert_no_more(&delivered.bodies);
    queue.stop();
}

#[test]
fn duplicate_cacheable_requests_coalesce_onto_one_fetch() {
    let transport = MockTransport::new(vec![Ok(ok_response(
        b"shared-bytes",
        &[("cache-control", "max-age=60")],
    ))]);
    let cache_dir = tempfile::tempdir().expect("create temp dir");
    let queue = queue_with(Arc::clone(&transport), cache_dir.path());

    let url = "https://api.test/v1/shared";
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (builder, delivered) = observed_request(Method::GET, url);
        queue.add(builder.build().expect("request builds"));
        receivers.push(delivered);
    }
    queue.start();

    for delivered in &receivers {
        let body = delivered
            .bodies
            .recv_timeout(RECV_TIMEOUT)
            .expect("every coalesced request delivers");
        assert_eq!(body.as_ref(), b"shared-bytes");
    }
    assert_eq!(transport.calls().len(), 1, "one transport call for the key");
    queue.stop();
}

#[test]
fn unauthorized_refreshes_token_and_retries_once() {
    struct RotatingAuthenticator {
        tokens: Mutex<VecDeque<&'static str>>,
    }
    impl fetchq::Authenticator for RotatingAuthenticator {
        fn auth_token(&self) -> Result<String, fetchq::AuthError> {
            let token = self
                .tokens
                .lock()
                .expect("lock tokens")
                .pop_front()
                .ok_or_else(|| fetchq::AuthError::new("token source exhausted"))?;
            Ok(token.to_owned())
        }
    }

    let transport = MockTransport::new(vec![
        Ok(status_response(StatusCode::UNAUTHORIZED)),
        Ok(ok_response(b"authorized", &[])),
    ]);
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .authenticator(RotatingAuthenticator {
            tokens: Mutex::new(VecDeque::from(["tokenA", "tokenB"])),
        })
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");
    queue.start();

    let (builder, delivered) = observed_request(Method::GET, "https://api.test/v1/secure");
    queue.add(
        builder
            .should_cache(false)
            .build()
            .expect("request builds"),
    );

    let body = delivered
        .bodies
        .recv_timeout(RECV_TIMEOUT)
        .expect("retried request delivers");
    assert_eq!(body.as_ref(), b"authorized");

    let calls = transport.calls();
    assert_eq!(calls.len(), 2, "401 then authorized retry");
    assert_eq!(
        calls[0]
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
        Some("Bearer tokenA")
    );
    assert_eq!(
        calls[1]
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
        Some("Bearer tokenB")
    );
    queue.stop();
}

#[test]
fn exhausted_retry_budget_delivers_timeout() {
    let transport = MockTransport::new(vec![
        Err(TransportError::Timeout),
        Err(TransportError::Timeout),
    ]);
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");
    queue.start();

    let (builder, delivered) = observed_request(Method::GET, "https://api.test/v1/slow");
    queue.add(
        builder
            .should_cache(false)
            .retry_policy(RetryPolicy::new(Duration::from_millis(10), 1, 1.0))
            .build()
            .expect("request builds"),
    );

    let code = delivered
        .errors
        .recv_timeout(RECV_TIMEOUT)
        .expect("exhausted retries deliver an error");
    assert_eq!(code, "timeout");
    assert_eq!(transport.calls().len(), 2, "initial attempt plus one retry");
    assert_no_more(&delivered.bodies);
    queue.stop();
}

#[test]
fn immediate_priority_overtakes_low_priority_backlog() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let transport = MockTransport::gated(Vec::new(), entered_tx, release_rx);
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .network_threads(1)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");
    queue.start();

    let blocker = Request::bytes(Method::GET, "https://api.test/v1/blocker")
        .should_cache(false)
        .build()
        .expect("request builds");
    queue.add(blocker);
    entered_rx
        .recv_timeout(RECV_TIMEOUT)
        .expect("worker reaches the transport");

    // With the single worker held, a later IMMEDIATE must overtake an
    // earlier LOW.
    let low = Request::bytes(Method::GET, "https://api.test/v1/low")
        .should_cache(false)
        .priority(Priority::Low)
        .build()
        .expect("request builds");
    let immediate = Request::bytes(Method::GET, "https://api.test/v1/immediate")
        .should_cache(false)
        .priority(Priority::Immediate)
        .build()
        .expect("request builds");
    queue.add(low);
    queue.add(immediate);
    release_tx.send(()).expect("release the held call");

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while transport.calls().len() < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let order: Vec<String> = transport.calls().iter().map(|call| call.url.clone()).collect();
    assert_eq!(
        order,
        vec![
            "https://api.test/v1/blocker".to_owned(),
            "https://api.test/v1/immediate".to_owned(),
            "https://api.test/v1/low".to_owned(),
        ]
    );
    queue.stop();
}

#[test]
fn full_invalidation_routes_through_the_network() {
    let transport = MockTransport::new(vec![Ok(ok_response(
        b"refetched",
        &[("cache-control", "max-age=60")],
    ))]);
    let cache_dir = tempfile::tempdir().expect("create temp dir");
    let queue = queue_with(Arc::clone(&transport), cache_dir.path());

    let url = "https://api.test/v1/invalidate";
    let key = format!("GET {url}");
    let now = epoch_millis();
    queue
        .cache()
        .put(&key, fresh_entry(b"old-bytes", now + 60_000, now + 60_000, None));
    queue.cache().invalidate(&key, true);

    queue.start();
    let (builder, delivered) = observed_request(Method::GET, url);
    queue.add(builder.build().expect("request builds"));

    let body = delivered
        .bodies
        .recv_timeout(RECV_TIMEOUT)
        .expect("invalidated key refetches");
    assert_eq!(body.as_ref(), b"refetched");
    assert_eq!(transport.calls().len(), 1, "invalidation must force a fetch");
    queue.stop();
}

#[test]
fn canceled_requests_are_never_delivered() {
    let transport = MockTransport::new(Vec::new());
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");

    let (builder, delivered) = observed_request(Method::GET, "https://api.test/v1/canceled");
    queue.add(
        builder
            .should_cache(false)
            .tag("doomed")
            .build()
            .expect("request builds"),
    );
    queue.cancel_all_with_tag("doomed");
    queue.start();

    assert_no_more(&delivered.bodies);
    assert!(
        delivered.errors.try_recv().is_err(),
        "canceled request must not surface an error either"
    );
    queue.stop();
}

#[test]
fn client_error_is_terminal_and_reports_request_code() {
    let transport = MockTransport::new(vec![Ok(status_response(StatusCode::NOT_FOUND))]);
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");
    queue.start();

    let (builder, delivered) = observed_request(Method::GET, "https://api.test/v1/missing");
    queue.add(
        builder
            .should_cache(false)
            .build()
            .expect("request builds"),
    );

    let code = delivered
        .errors
        .recv_timeout(RECV_TIMEOUT)
        .expect("404 surfaces an error");
    assert_eq!(code, "request");
    assert_eq!(transport.calls().len(), 1, "4xx must not retry");
    queue.stop();
}

#[test]
fn server_error_retries_then_succeeds() {
    let transport = MockTransport::new(vec![
        Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR)),
        Ok(ok_response(b"second-try", &[])),
    ]);
    let queue = RequestQueue::builder()
        .transport_arc(Arc::clone(&transport) as Arc<dyn Transport>)
        .delivery_executor(ImmediateExecutor)
        .build()
        .expect("queue builds");
    queue.start();

    let (builder, delivered) = observed_request(Method::GET, "https://api.test/v1/flaky");
    queue.add(
        builder
            .should_cache(false)
            .build()
            .expect("request builds"),
    );

    let body = delivered
        .bodies
        .recv_timeout(RECV_TIMEOUT)
        .expect("5xx retry succeeds");
    assert_eq!(body.as_ref(), b"second-try");
    assert_eq!(transport.calls().len(), 2);
    queue.stop();
}
