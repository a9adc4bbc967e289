use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// One complete HTTP response as seen by the dispatchers: status, body
/// bytes, case-insensitive headers, and how long the network path took.
/// `not_modified` marks a 304 whose body was filled in from the cache
/// entry's data (or left empty when there was no entry to validate).
#[derive(Clone, Debug)]
pub struct NetworkResponse {
    pub status: StatusCode,
    pub data: Bytes,
    pub headers: HeaderMap,
    pub not_modified: bool,
    pub network_time_ms: u64,
}

impl NetworkResponse {
    pub fn new(status: StatusCode, data: Bytes, headers: HeaderMap) -> Self {
        Self {
            status,
            data,
            headers,
            not_modified: false,
            network_time_ms: 0,
        }
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
