use bytes::Bytes;
use http::{HeaderMap, Method};

/// The pre-encoded wire form of a request: everything a transport driver
/// needs for one attempt.
#[derive(Clone, Debug)]
pub struct NetworkRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl NetworkRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}
