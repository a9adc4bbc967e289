//! `fetchq` is a client-side HTTP request library built around a
//! prioritized request queue with a cache tier and a network tier.
//!
//! Requests are typed; a cache dispatcher serves fresh entries without
//! touching the network, soft-expired entries are served immediately and
//! revalidated in the background, and a pool of network dispatchers runs
//! the transport with retry, backoff, and bearer-token refresh. Results
//! are delivered on a caller-designated executor.
//!
//! # Quick Start
//!
//! ```no_run
//! use http::Method;
//! use fetchq::{Priority, Request, RequestQueue};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! # fn demo() -> fetchq::Result<()> {
//! let queue = RequestQueue::builder()
//!     .cache_dir("/tmp/fetchq-cache")
//!     .network_threads(4)
//!     .build()?;
//! queue.start();
//!
//! let request = Request::<Item>::json(Method::GET, "https://api.example.com/v1/items/1")
//!     .priority(Priority::High)
//!     .tag("items")
//!     .on_response(|item| println!("got {}", item.id))
//!     .on_error(|error| eprintln!("failed: {error}"))
//!     .build()?;
//! queue.add(request);
//! # Ok(())
//! # }
//! ```
//!
//! # Recommended Defaults
//!
//! - GET requests cache by default; everything else skips the cache tier.
//! - Keep the stock retry policy (2500 ms, one retry) unless the target
//!   service is known to tolerate more.
//! - Supply a delivery executor bound to your event loop; the fallback is
//!   a dedicated delivery thread.

mod cache;
mod converter;
mod core;
mod delivery;
mod dispatch;
mod http;
mod network;
mod queue;
mod request;
#[cfg(feature = "ureq-transport")]
mod transport;

pub(crate) use crate::core::config;
pub(crate) use crate::core::error;
pub(crate) use crate::core::headers;
pub(crate) use crate::core::pool;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::util;

pub use crate::cache::{Cache, DiskCache, Entry, NoCache};
pub use crate::config::QueueConfig;
pub use crate::converter::{
    BytesConverter, ConvertError, EncodedBody, FormBody, JsonBody, JsonConverter,
    RequestConverter, ResponseConverter, StringConverter,
};
pub use crate::delivery::{DeliveryExecutor, ImmediateExecutor, ThreadExecutor};
pub use crate::error::{Error, ErrorCode};
pub use crate::headers::{parse_cache_headers, parse_charset};
pub use crate::http::request::NetworkRequest;
pub use crate::http::response::NetworkResponse;
pub use crate::network::{AuthError, Authenticator, RawResponse, Transport, TransportError};
pub use crate::pool::{ByteArrayPool, PooledByteSink};
pub use crate::queue::{RequestQueue, RequestQueueBuilder};
pub use crate::request::{Priority, Request, RequestBuilder, RequestView};
pub use crate::retry::RetryPolicy;
#[cfg(feature = "ureq-transport")]
pub use crate::transport::UreqTransport;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Cache, DiskCache, Entry, Error, ErrorCode, Priority, Request, RequestQueue, Result,
        RetryPolicy,
    };
}

#[cfg(test)]
mod tests;
