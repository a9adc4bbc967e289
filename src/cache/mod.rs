use bytes::Bytes;
use http::HeaderMap;

pub(crate) mod disk;

pub use disk::DiskCache;

/// Persistent key → [`Entry`] store consulted by the cache dispatcher and
/// written by any dispatcher. Implementations serialize internally; every
/// method takes `&self` and may be called from any thread.
pub trait Cache: Send + Sync {
    /// One-time scan/recovery pass; called by the cache dispatcher before
    /// it starts draining its queue.
    fn initialize(&self) {}

    fn get(&self, key: &str) -> Option<Entry>;

    fn put(&self, key: &str, entry: Entry);

    /// Forces revalidation on the next access. With `full_expire` the entry
    /// also stops being servable while the revalidation runs.
    fn invalidate(&self, key: &str, full_expire: bool);

    fn remove(&self, key: &str);

    fn clear(&self);
}

/// A cached HTTP response with its validators and expiries. Expiries are
/// epoch milliseconds; `soft_ttl <= ttl` always holds for entries produced
/// by the header parser.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    pub data: Bytes,
    pub etag: Option<String>,
    pub server_date: u64,
    pub last_modified: u64,
    /// Hard expiry: past this instant the entry must not be served without
    /// revalidation.
    pub ttl: u64,
    /// Soft expiry: past this instant the entry must be revalidated but may
    /// still be served while the revalidation runs.
    pub soft_ttl: u64,
    pub response_headers: HeaderMap,
}

impl Entry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.ttl <= now_ms
    }

    pub fn refresh_needed(&self, now_ms: u64) -> bool {
        self.soft_ttl <= now_ms
    }
}

/// Cache that stores nothing; for queues that only ever go to the network.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, _key: &str) -> Option<Entry> {
        None
    }

    fn put(&self, _key: &str, _entry: Entry) {}

    fn invalidate(&self, _key: &str, _full_expire: bool) {}

    fn remove(&self, _key: &str) {}

    fn clear(&self) {}
}
