use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::cache::disk::EntryHeader;
use crate::cache::Entry;
use crate::dispatch::DispatchQueue;
use crate::error::{Error, ErrorCode};
use crate::headers::{parse_cache_headers, parse_charset};
use crate::http::NetworkResponse;
use crate::pool::{ByteArrayPool, PooledByteSink};
use crate::request::{Priority, QueuedRequest, Request};
use crate::retry::RetryPolicy;
use crate::util::epoch_millis;

fn response_with_headers(pairs: &[(&str, &str)]) -> NetworkResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(
            http::header::HeaderName::try_from(*name).expect("valid header name"),
            HeaderValue::try_from(*value).expect("valid header value"),
        );
    }
    NetworkResponse::new(StatusCode::OK, Bytes::from_static(b"body"), headers)
}

#[test]
fn retry_policy_exhausts_after_max_retries_plus_one_attempts() {
    let mut policy = RetryPolicy::new(Duration::from_millis(100), 1, 1.0);
    policy
        .retry(Error::Timeout { network_time_ms: 0 })
        .expect("first retry should be granted");
    let error = policy
        .retry(Error::Timeout { network_time_ms: 0 })
        .expect_err("second retry should exhaust the budget");
    assert!(matches!(error, Error::Timeout { .. }));
    assert_eq!(policy.retry_count(), 1);
}

#[test]
fn retry_policy_grows_timeout_by_backoff_multiplier() {
    let mut policy = RetryPolicy::new(Duration::from_millis(100), 3, 1.0);
    assert_eq!(policy.current_timeout(), Duration::from_millis(100));
    policy
        .retry(Error::Timeout { network_time_ms: 0 })
        .expect("retry within budget");
    assert_eq!(policy.current_timeout(), Duration::from_millis(200));
    policy
        .retry(Error::Timeout { network_time_ms: 0 })
        .expect("retry within budget");
    assert_eq!(policy.current_timeout(), Duration::from_millis(400));
}

#[test]
fn retry_policy_none_rejects_first_retry() {
    let mut policy = RetryPolicy::none(Duration::from_millis(100));
    policy
        .retry(Error::Timeout { network_time_ms: 0 })
        .expect_err("zero-retry policy should fail immediately");
}

#[test]
fn parse_cache_headers_honors_max_age() {
    let response = response_with_headers(&[("cache-control", "public, max-age=60")]);
    let entry = parse_cache_headers(&response).expect("cacheable response");
    let now = epoch_millis();
    assert!(entry.soft_ttl > now + 50_000);
    assert!(entry.soft_ttl <= now + 60_000);
    assert_eq!(entry.soft_ttl, entry.ttl);
}

#[test]
fn parse_cache_headers_rejects_no_cache_and_no_store() {
    for directive in ["no-cache", "no-store", "max-age=10, no-store"] {
        let response = response_with_headers(&[("cache-control", directive)]);
        assert!(
            parse_cache_headers(&response).is_none(),
            "directive {directive} must prevent caching"
        );
    }
}

#[test]
fn parse_cache_headers_stale_while_revalidate_extends_hard_ttl() {
    let response =
        response_with_headers(&[("cache-control", "max-age=60, stale-while-revalidate=30")]);
    let entry = parse_cache_headers(&response).expect("cacheable response");
    assert_eq!(entry.ttl, entry.soft_ttl + 30_000);
}

#[test]
fn parse_cache_headers_must_revalidate_pins_ttls_together() {
    let response = response_with_headers(&[(
        "cache-control",
        "max-age=60, stale-while-revalidate=30, must-revalidate",
    )]);
    let entry = parse_cache_headers(&response).expect("cacheable response");
    assert_eq!(entry.ttl, entry.soft_ttl);
}

#[test]
fn parse_cache_headers_derives_lifetime_from_expires() {
    let now = epoch_millis();
    let date = crate::headers::format_epoch_millis(now);
    let expires = crate::headers::format_epoch_millis(now + 90_000);
    let response = response_with_headers(&[("date", &date), ("expires", &expires)]);
    let entry = parse_cache_headers(&response).expect("cacheable response");
    assert!(entry.soft_ttl >= now + 85_000);
    assert!(entry.soft_ttl <= now + 95_000);
    assert_eq!(entry.soft_ttl, entry.ttl);
}

#[test]
fn parse_cache_headers_extracts_validators() {
    let response = response_with_headers(&[
        ("cache-control", "max-age=1"),
        ("etag", "W/\"v1\""),
        ("last-modified", "Fri, 20 Jun 2025 10:00:00 GMT"),
    ]);
    let entry = parse_cache_headers(&response).expect("cacheable response");
    assert_eq!(entry.etag.as_deref(), Some("W/\"v1\""));
    assert!(entry.last_modified > 0);
}

#[test]
fn parse_cache_headers_soft_ttl_never_exceeds_ttl() {
    for directives in [
        "max-age=60",
        "max-age=60, stale-while-revalidate=120",
        "max-age=0",
        "must-revalidate, max-age=30",
    ] {
        let response = response_with_headers(&[("cache-control", directives)]);
        let entry = parse_cache_headers(&response).expect("cacheable response");
        assert!(
            entry.soft_ttl <= entry.ttl,
            "soft ttl exceeded hard ttl for {directives}"
        );
    }
}

#[test]
fn parse_charset_defaults_to_latin1() {
    let headers = HeaderMap::new();
    assert_eq!(parse_charset(&headers), "ISO-8859-1");
}

#[test]
fn parse_charset_reads_content_type_parameter() {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    assert_eq!(parse_charset(&headers), "utf-8");
}

#[test]
fn entry_freshness_predicates_follow_ttls() {
    let entry = Entry {
        soft_ttl: 1_000,
        ttl: 2_000,
        ..Entry::default()
    };
    assert!(!entry.refresh_needed(999));
    assert!(entry.refresh_needed(1_000));
    assert!(!entry.is_expired(1_999));
    assert!(entry.is_expired(2_000));
}

#[test]
fn entry_header_round_trips_through_disk_layout() {
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response_headers.append("x-trace", HeaderValue::from_static("abc"));
    let entry = Entry {
        data: Bytes::from_static(b"ignored-by-header"),
        etag: Some("\"v2\"".to_owned()),
        server_date: 11,
        last_modified: 22,
        ttl: 44,
        soft_ttl: 33,
        response_headers,
    };

    let header = EntryHeader::from_entry("GET https://example.com/a", &entry);
    let mut serialized = Vec::new();
    header.write(&mut serialized).expect("header serializes");
    let parsed =
        EntryHeader::read(&mut serialized.as_slice()).expect("header parses back");

    assert_eq!(parsed.key, "GET https://example.com/a");
    assert_eq!(parsed.etag.as_deref(), Some("\"v2\""));
    assert_eq!(parsed.server_date, 11);
    assert_eq!(parsed.last_modified, 22);
    assert_eq!(parsed.ttl, 44);
    assert_eq!(parsed.soft_ttl, 33);
    assert_eq!(parsed.response_headers, entry.response_headers);
}

#[test]
fn entry_header_rejects_bad_magic() {
    let mut serialized = Vec::new();
    EntryHeader::from_entry("GET https://example.com/a", &Entry::default())
        .write(&mut serialized)
        .expect("header serializes");
    serialized[0] ^= 0xff;
    EntryHeader::read(&mut serialized.as_slice()).expect_err("corrupt magic must fail");
}

#[test]
fn pool_reuses_returned_buffers() {
    let pool = ByteArrayPool::new(4096);
    let buffer = pool.get_buf(100);
    assert_eq!(buffer.len(), 100);
    pool.return_buf(buffer);
    assert_eq!(pool.pooled_bytes(), 100);
    let again = pool.get_buf(50);
    assert_eq!(again.len(), 100, "smallest fitting buffer should be reused");
    assert_eq!(pool.pooled_bytes(), 0);
}

#[test]
fn pool_discards_oversized_buffers() {
    let pool = ByteArrayPool::new(64);
    pool.return_buf(vec![0; 65]);
    assert_eq!(pool.pooled_bytes(), 0);
}

#[test]
fn pool_evicts_oldest_past_the_cap() {
    let pool = ByteArrayPool::new(100);
    pool.return_buf(vec![0; 60]);
    pool.return_buf(vec![0; 50]);
    assert_eq!(pool.pooled_bytes(), 50, "oldest buffer should be evicted");
    let survivor = pool.get_buf(1);
    assert_eq!(survivor.len(), 50);
}

#[test]
fn pooled_sink_grows_and_copies() {
    let pool = Arc::new(ByteArrayPool::new(4096));
    let mut sink = PooledByteSink::with_size_hint(Arc::clone(&pool), 4);
    sink.write_all(b"hello ").expect("write succeeds");
    sink.write_all(b"world").expect("write succeeds");
    assert_eq!(sink.len(), 11);
    assert_eq!(sink.to_bytes().as_ref(), b"hello world");
    drop(sink);
    assert!(pool.pooled_bytes() >= 11, "live buffer returns on drop");
}

#[test]
fn dispatch_queue_orders_by_priority_then_sequence() {
    let queue = DispatchQueue::new();
    for (sequence, priority) in [
        (0, Priority::Low),
        (1, Priority::Immediate),
        (2, Priority::Normal),
        (3, Priority::Immediate),
    ] {
        let request = Request::bytes(Method::GET, format!("https://example.com/{sequence}"))
            .priority(priority)
            .build()
            .expect("request builds");
        let request: Arc<dyn QueuedRequest> = Arc::new(request);
        request.set_sequence(sequence);
        queue.push(request);
    }

    let order: Vec<u64> = (0..4)
        .map(|_| queue.take().expect("queue is non-empty").sequence())
        .collect();
    assert_eq!(order, vec![1, 3, 2, 0]);
}

#[test]
fn dispatch_queue_take_returns_none_once_closed() {
    let queue = DispatchQueue::new();
    queue.close();
    assert!(queue.take().is_none());
}

#[test]
fn request_cache_key_is_method_and_url() {
    let request = Request::bytes(Method::GET, "https://example.com/a")
        .build()
        .expect("request builds");
    assert_eq!(request.cache_key(), "GET https://example.com/a");
}

#[test]
fn cache_key_override_replaces_the_default() {
    let request = Request::bytes(Method::GET, "https://example.com/img")
        .cache_key("GET https://example.com/img#128x128")
        .build()
        .expect("request builds");
    assert_eq!(request.cache_key(), "GET https://example.com/img#128x128");
}

#[test]
fn get_requests_cache_by_default_and_post_does_not() {
    let get = Request::bytes(Method::GET, "https://example.com/a")
        .build()
        .expect("request builds");
    let post = Request::bytes(Method::POST, "https://example.com/a")
        .build()
        .expect("request builds");
    assert!(QueuedRequest::should_cache(&get));
    assert!(!QueuedRequest::should_cache(&post));
}

#[test]
fn request_builder_rejects_malformed_url() {
    let error = Request::bytes(Method::GET, "not a url")
        .build()
        .expect_err("malformed url must fail");
    assert_eq!(error.code(), ErrorCode::BadUrl);
}

#[test]
fn error_code_maps_expected_variant() {
    let error = Error::Timeout { network_time_ms: 7 };
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(error.code().as_str(), "timeout");
    assert_eq!(error.network_time_ms(), 7);
}

#[test]
fn string_converter_decodes_latin1_by_default() {
    use crate::converter::{ResponseConverter, StringConverter};
    let response = NetworkResponse::new(
        StatusCode::OK,
        Bytes::from_static(&[0x63, 0x61, 0x66, 0xe9]),
        HeaderMap::new(),
    );
    let decoded = StringConverter
        .convert(&response)
        .expect("latin1 always decodes");
    assert_eq!(decoded, "café");
}

#[test]
fn json_converter_rejects_empty_body() {
    use crate::converter::{ConvertError, JsonConverter, ResponseConverter};
    let response = NetworkResponse::new(StatusCode::OK, Bytes::new(), HeaderMap::new());
    let converter = JsonConverter::<serde_json::Value>::new();
    let error = converter
        .convert(&response)
        .expect_err("empty body must not parse");
    assert!(matches!(error, ConvertError::EmptyBody));
}
