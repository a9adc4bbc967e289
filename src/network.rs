use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{AUTHORIZATION, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error as ThisError;
use tracing::{debug, warn};

use crate::cache::Entry;
use crate::error::Error;
use crate::headers::format_epoch_millis;
use crate::http::{NetworkRequest, NetworkResponse};
use crate::request::QueuedRequest;
use crate::util::{elapsed_millis, lock_unpoisoned, merge_headers};

/// One HTTP attempt as produced by a transport driver, before the network
/// layer stamps elapsed time and 304 semantics onto it.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub data: Bytes,
}

/// Typed failure of a single transport attempt. Drivers never retry
/// internally; classification here drives the retry loop above them.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum TransportError {
    #[error("attempt timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("malformed url: {0}")]
    BadUrl(String),
    #[error("i/o failed mid-exchange: {0}")]
    Io(#[source] std::io::Error),
}

/// Replaceable driver executing exactly one HTTP attempt. Implementations
/// must honor `timeout` as the socket/overall budget for the attempt and
/// surface timeouts as [`TransportError::Timeout`].
pub trait Transport: Send + Sync {
    fn perform(
        &self,
        request: &NetworkRequest,
        extra_headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;
}

/// Bearer-token source consulted by the network layer. `auth_token` is
/// called on a dispatcher thread and may block (e.g. refresh round-trip).
///
/// On a 401 the cached token is invalidated and fetched again, once per
/// request. Two in-flight requests hitting 401 together may both refresh;
/// coordination across requests is left to the implementation.
pub trait Authenticator: Send + Sync {
    fn auth_token(&self) -> Result<String, AuthError>;

    /// Called with the token a 401 response rejected.
    fn invalidate_token(&self, _token: &str) {}
}

#[derive(Debug, ThisError)]
#[error("failed to obtain auth token: {message}")]
pub struct AuthError {
    pub message: String,
    /// Optional hint surfaced to error listeners on how to recover (a
    /// re-login URL, for instance).
    pub resolution: Option<String>,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resolution: None,
        }
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }
}

/// Executes the full retry loop for one request on the calling dispatcher
/// thread: validator and auth headers, one transport attempt per
/// iteration, status classification, and 304 merging.
pub(crate) struct Network {
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn Authenticator>>,
    auth_token: Mutex<Option<String>>,
    slow_request_threshold: Duration,
}

impl Network {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
        slow_request_threshold: Duration,
    ) -> Self {
        Self {
            transport,
            authenticator,
            auth_token: Mutex::new(None),
            slow_request_threshold,
        }
    }

    pub(crate) fn perform_request(
        &self,
        request: &dyn QueuedRequest,
    ) -> Result<NetworkResponse, Error> {
        let started = Instant::now();
        loop {
            let entry = request.cache_entry();
            let mut attempt_headers = HeaderMap::new();
            add_validator_headers(&mut attempt_headers, entry.as_ref());
            self.add_auth_headers(&mut attempt_headers)
                .map_err(|auth| Error::AuthFailure {
                    response: None,
                    resolution: auth.resolution,
                    network_time_ms: elapsed_millis(started),
                })?;

            let timeout = request.current_timeout();
            let attempt = self
                .transport
                .perform(request.network_request(), &attempt_headers, timeout);
            let elapsed = elapsed_millis(started);

            match attempt {
                Ok(raw) => {
                    self.log_attempt(request, &raw, started);
                    let status = raw.status;
                    if status == StatusCode::NOT_MODIFIED {
                        return Ok(not_modified_response(entry, raw, elapsed));
                    }
                    if status.is_success() {
                        return Ok(NetworkResponse {
                            status,
                            data: raw.data,
                            headers: raw.headers,
                            not_modified: false,
                            network_time_ms: elapsed,
                        });
                    }

                    let response = NetworkResponse {
                        status,
                        data: raw.data,
                        headers: raw.headers,
                        not_modified: false,
                        network_time_ms: elapsed,
                    };
                    if status == StatusCode::UNAUTHORIZED {
                        self.handle_unauthorized(request, response)?;
                    } else if status == StatusCode::FORBIDDEN {
                        return Err(Error::Forbidden {
                            response,
                            network_time_ms: elapsed,
                        });
                    } else if status == StatusCode::REQUEST_TIMEOUT
                        || status == StatusCode::GATEWAY_TIMEOUT
                    {
                        attempt_retry(
                            request,
                            Error::Timeout {
                                network_time_ms: elapsed,
                            },
                            "http-timeout",
                        )?;
                    } else if status.is_client_error() {
                        return Err(Error::Request {
                            response,
                            network_time_ms: elapsed,
                        });
                    } else if status.is_server_error() {
                        attempt_retry(
                            request,
                            Error::Server {
                                response,
                                network_time_ms: elapsed,
                            },
                            "server",
                        )?;
                    } else {
                        return Err(Error::Network {
                            response: Some(response),
                            message: format!("unclassified status {status}"),
                            network_time_ms: elapsed,
                        });
                    }
                }
                Err(TransportError::Timeout) => {
                    attempt_retry(
                        request,
                        Error::Timeout {
                            network_time_ms: elapsed,
                        },
                        "socket",
                    )?;
                }
                Err(TransportError::BadUrl(url)) => {
                    return Err(Error::BadUrl { url });
                }
                Err(TransportError::Connect(source)) => {
                    return Err(Error::NoConnection {
                        source,
                        network_time_ms: elapsed,
                    });
                }
                Err(TransportError::Io(source)) => {
                    return Err(Error::Network {
                        response: None,
                        message: source.to_string(),
                        network_time_ms: elapsed,
                    });
                }
            }
        }
    }

    /// 401 with an authenticator: drop the cached token, fetch a fresh
    /// one, then spend a retry attempt. Without one the failure is final.
    fn handle_unauthorized(
        &self,
        request: &dyn QueuedRequest,
        response: NetworkResponse,
    ) -> Result<(), Error> {
        let network_time_ms = response.network_time_ms;
        let Some(authenticator) = &self.authenticator else {
            return Err(Error::AuthFailure {
                response: Some(response),
                resolution: None,
                network_time_ms,
            });
        };
        if let Some(rejected) = lock_unpoisoned(&self.auth_token).take() {
            authenticator.invalidate_token(&rejected);
        }
        match authenticator.auth_token() {
            Ok(fresh) => {
                *lock_unpoisoned(&self.auth_token) = Some(fresh);
            }
            Err(auth) => {
                return Err(Error::AuthFailure {
                    response: Some(response),
                    resolution: auth.resolution,
                    network_time_ms,
                });
            }
        }
        attempt_retry(
            request,
            Error::AuthFailure {
                response: Some(response),
                resolution: None,
                network_time_ms,
            },
            "auth",
        )
    }

    fn add_auth_headers(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };
        let mut cached = lock_unpoisoned(&self.auth_token);
        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let fresh = authenticator.auth_token()?;
                *cached = Some(fresh.clone());
                fresh
            }
        };
        let value = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(|_| AuthError::new("token is not a valid header value"))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn log_attempt(&self, request: &dyn QueuedRequest, raw: &RawResponse, started: Instant) {
        let lifetime = started.elapsed();
        if lifetime > self.slow_request_threshold {
            warn!(
                url = %request.network_request().url,
                lifetime_ms = lifetime.as_millis() as u64,
                size = raw.data.len(),
                status = raw.status.as_u16(),
                retry_count = request.retry_count(),
                "slow request"
            );
        } else {
            debug!(
                url = %request.network_request().url,
                lifetime_ms = lifetime.as_millis() as u64,
                status = raw.status.as_u16(),
                "attempt completed"
            );
        }
    }
}

/// Spends one retry from the request's policy, or propagates `error` as
/// the final outcome when the budget is gone.
fn attempt_retry(request: &dyn QueuedRequest, error: Error, label: &str) -> Result<(), Error> {
    let old_timeout = request.current_timeout();
    match request.retry(error) {
        Ok(()) => {
            debug!(
                label,
                old_timeout_ms = old_timeout.as_millis() as u64,
                retry_count = request.retry_count(),
                "scheduling retry"
            );
            Ok(())
        }
        Err(error) => {
            debug!(
                label,
                old_timeout_ms = old_timeout.as_millis() as u64,
                "retry budget exhausted"
            );
            Err(error)
        }
    }
}

fn add_validator_headers(headers: &mut HeaderMap, entry: Option<&Entry>) {
    let Some(entry) = entry else {
        return;
    };
    if let Some(etag) = &entry.etag {
        if let Ok(value) = HeaderValue::try_from(etag.as_str()) {
            headers.insert(IF_NONE_MATCH, value);
        }
    }
    if entry.last_modified > 0 {
        let formatted = format_epoch_millis(entry.last_modified);
        if let Ok(value) = HeaderValue::try_from(formatted) {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
    }
}

/// A 304 has sparse headers; the entry's stored headers are the base and
/// the fresh ones win. Without an entry to validate against, the 304 is
/// passed through with an empty body.
fn not_modified_response(entry: Option<Entry>, raw: RawResponse, elapsed: u64) -> NetworkResponse {
    match entry {
        Some(entry) => NetworkResponse {
            status: StatusCode::NOT_MODIFIED,
            data: entry.data,
            headers: merge_headers(&entry.response_headers, &raw.headers),
            not_modified: true,
            network_time_ms: elapsed,
        },
        None => NetworkResponse {
            status: StatusCode::NOT_MODIFIED,
            data: Bytes::new(),
            headers: raw.headers,
            not_modified: true,
            network_time_ms: elapsed,
        },
    }
}
