use std::time::{Duration, UNIX_EPOCH};

use http::HeaderMap;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, DATE, ETAG, EXPIRES, LAST_MODIFIED};

use crate::cache::Entry;
use crate::http::NetworkResponse;
use crate::util::epoch_millis;

pub const DEFAULT_CHARSET: &str = "ISO-8859-1";

/// Derives a cache entry from the response's freshness and validator
/// headers. Returns `None` when the response must not be cached
/// (`no-cache` / `no-store`).
///
/// `Cache-Control` wins over `Expires`; `max-age` sets the soft expiry,
/// `stale-while-revalidate` extends the hard expiry past it, and
/// `must-revalidate` / `proxy-revalidate` pin the two together.
pub fn parse_cache_headers(response: &NetworkResponse) -> Option<Entry> {
    let now = epoch_millis();
    let headers = &response.headers;

    let server_date = match header_str(headers, DATE.as_str()).map(parse_date_epoch_millis) {
        Some(parsed) if parsed > 0 => parsed,
        _ => now,
    };
    let last_modified = header_str(headers, LAST_MODIFIED.as_str())
        .map(parse_date_epoch_millis)
        .unwrap_or(0);
    let etag = header_str(headers, ETAG.as_str()).map(str::to_owned);

    let mut has_cache_control = false;
    let mut max_age_secs = 0u64;
    let mut stale_while_revalidate_secs = 0u64;
    let mut must_revalidate = false;
    if let Some(value) = header_str(headers, CACHE_CONTROL.as_str()) {
        has_cache_control = true;
        for directive in value.split(',').map(str::trim) {
            if directive == "no-cache" || directive == "no-store" {
                return None;
            } else if let Some(seconds) = directive.strip_prefix("max-age=") {
                max_age_secs = seconds.parse().unwrap_or(0);
            } else if let Some(seconds) = directive.strip_prefix("stale-while-revalidate=") {
                stale_while_revalidate_secs = seconds.parse().unwrap_or(0);
            } else if directive == "must-revalidate" || directive == "proxy-revalidate" {
                must_revalidate = true;
            }
        }
    }

    let (soft_ttl, ttl) = if has_cache_control {
        let soft = now.saturating_add(max_age_secs.saturating_mul(1000));
        let hard = if must_revalidate {
            soft
        } else {
            soft.saturating_add(stale_while_revalidate_secs.saturating_mul(1000))
        };
        (soft, hard)
    } else {
        let server_expires = header_str(headers, EXPIRES.as_str())
            .map(parse_date_epoch_millis)
            .unwrap_or(0);
        if server_expires >= server_date && server_expires > 0 {
            let soft = now + (server_expires - server_date);
            (soft, soft)
        } else {
            (0, 0)
        }
    };

    Some(Entry {
        data: response.data.clone(),
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers: headers.clone(),
    })
}

/// Charset named by `Content-Type`, or `ISO-8859-1` when absent.
pub fn parse_charset(headers: &HeaderMap) -> String {
    let Some(content_type) = header_str(headers, CONTENT_TYPE.as_str()) else {
        return DEFAULT_CHARSET.to_owned();
    };
    for parameter in content_type.split(';').skip(1) {
        let parameter = parameter.trim();
        if let Some(charset) = parameter.strip_prefix("charset=") {
            return charset.trim_matches('"').to_owned();
        }
    }
    DEFAULT_CHARSET.to_owned()
}

/// RFC 1123 date to epoch milliseconds; 0 on malformed input.
pub(crate) fn parse_date_epoch_millis(value: &str) -> u64 {
    httpdate::parse_http_date(value)
        .ok()
        .and_then(|date| date.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn format_epoch_millis(epoch_ms: u64) -> String {
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(epoch_ms))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
