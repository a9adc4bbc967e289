use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Uri};

use crate::http::NetworkRequest;
use crate::network::{RawResponse, Transport, TransportError};
use crate::pool::{ByteArrayPool, DEFAULT_POOL_MAX_BYTES, PooledByteSink};
use crate::util::merge_headers;

const BODY_CHUNK_LEN: usize = 8192;
const MAX_SINK_HINT: usize = 1024 * 1024;

/// Default blocking transport driver over a `ureq` agent. One `perform`
/// is exactly one HTTP exchange; retries, auth, and caching all live in
/// the layers above. Response bodies are copied through the shared
/// byte-buffer pool.
pub struct UreqTransport {
    agent: ureq::Agent,
    pool: Arc<ByteArrayPool>,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(ByteArrayPool::new(DEFAULT_POOL_MAX_BYTES)))
    }

    pub fn with_pool(pool: Arc<ByteArrayPool>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .user_agent(concat!("fetchq/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent: config.new_agent(),
            pool,
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn perform(
        &self,
        request: &NetworkRequest,
        extra_headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        if request.url.parse::<Uri>().is_err() {
            return Err(TransportError::BadUrl(request.url.clone()));
        }

        let merged = merge_headers(&request.headers, extra_headers);
        let mut builder = ureq::http::Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in &merged {
            builder = builder.header(name, value);
        }
        let body = request
            .body
            .as_ref()
            .map(|body| body.to_vec())
            .unwrap_or_default();
        let wire_request = builder
            .body(body)
            .map_err(|_| TransportError::BadUrl(request.url.clone()))?;

        let configured = self
            .agent
            .configure_request(wire_request)
            .timeout_global(Some(timeout))
            .timeout_per_call(Some(timeout))
            .timeout_connect(Some(timeout))
            .timeout_recv_response(Some(timeout))
            .timeout_recv_body(Some(timeout))
            .build();

        let mut response = self.agent.run(configured).map_err(classify_error)?;
        let status = response.status();
        let headers = response.headers().clone();

        let size_hint = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(BODY_CHUNK_LEN)
            .min(MAX_SINK_HINT);
        let mut sink = PooledByteSink::with_size_hint(Arc::clone(&self.pool), size_hint);
        let mut scratch = self.pool.get_buf(BODY_CHUNK_LEN);
        let mut reader = response.body_mut().as_reader();
        let copied = loop {
            match reader.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(read) => {
                    if let Err(error) = sink.write_all(&scratch[..read]) {
                        break Err(error);
                    }
                }
                Err(error) => break Err(error),
            }
        };
        self.pool.return_buf(scratch);
        copied.map_err(classify_io_error)?;

        Ok(RawResponse {
            status,
            headers,
            data: sink.to_bytes(),
        })
    }
}

fn classify_error(error: ureq::Error) -> TransportError {
    match error {
        ureq::Error::Timeout(_) => TransportError::Timeout,
        ureq::Error::HostNotFound
        | ureq::Error::ConnectionFailed
        | ureq::Error::ConnectProxyFailed(_) => {
            TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                error.to_string(),
            ))
        }
        ureq::Error::Io(source) => classify_io_error(source),
        other => TransportError::Io(std::io::Error::other(other.to_string())),
    }
}

fn classify_io_error(error: std::io::Error) -> TransportError {
    match error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::Timeout,
        std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::NotFound
        | std::io::ErrorKind::AddrNotAvailable => TransportError::Connect(error),
        _ => TransportError::Io(error),
    }
}
