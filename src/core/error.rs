use thiserror::Error;

use crate::http::NetworkResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Timeout,
    NoConnection,
    Network,
    Server,
    Request,
    AuthFailure,
    Forbidden,
    Parse,
    BadUrl,
    Config,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NoConnection => "no_connection",
            Self::Network => "network",
            Self::Server => "server",
            Self::Request => "request",
            Self::AuthFailure => "auth_failure",
            Self::Forbidden => "forbidden",
            Self::Parse => "parse",
            Self::BadUrl => "bad_url",
            Self::Config => "config",
        }
    }
}

/// Failure kinds carried end to end; exactly one of these reaches the
/// error listener of every request that does not succeed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request timed out after {network_time_ms}ms")]
    Timeout { network_time_ms: u64 },
    #[error("no connection could be established: {source}")]
    NoConnection {
        #[source]
        source: std::io::Error,
        network_time_ms: u64,
    },
    #[error("transport failed after {network_time_ms}ms: {message}")]
    Network {
        response: Option<NetworkResponse>,
        message: String,
        network_time_ms: u64,
    },
    #[error("server error {} after {network_time_ms}ms", .response.status)]
    Server {
        response: NetworkResponse,
        network_time_ms: u64,
    },
    #[error("request rejected with status {}", .response.status)]
    Request {
        response: NetworkResponse,
        network_time_ms: u64,
    },
    #[error("authentication failed")]
    AuthFailure {
        response: Option<NetworkResponse>,
        /// Hint from the authenticator on how the caller can resolve the
        /// failure (a re-login URL, for instance).
        resolution: Option<String>,
        network_time_ms: u64,
    },
    #[error("access forbidden with status {}", .response.status)]
    Forbidden {
        response: NetworkResponse,
        network_time_ms: u64,
    },
    #[error("failed to decode response body: {message}")]
    Parse { message: String, network_time_ms: u64 },
    #[error("malformed request url: {url}")]
    BadUrl { url: String },
    #[error("invalid queue configuration: {message}")]
    Config { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::NoConnection { .. } => ErrorCode::NoConnection,
            Self::Network { .. } => ErrorCode::Network,
            Self::Server { .. } => ErrorCode::Server,
            Self::Request { .. } => ErrorCode::Request,
            Self::AuthFailure { .. } => ErrorCode::AuthFailure,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::Parse { .. } => ErrorCode::Parse,
            Self::BadUrl { .. } => ErrorCode::BadUrl,
            Self::Config { .. } => ErrorCode::Config,
        }
    }

    /// The response attached to the failing attempt, where one exists.
    pub fn network_response(&self) -> Option<&NetworkResponse> {
        match self {
            Self::Server { response, .. }
            | Self::Request { response, .. }
            | Self::Forbidden { response, .. } => Some(response),
            Self::Network { response, .. } | Self::AuthFailure { response, .. } => {
                response.as_ref()
            }
            _ => None,
        }
    }

    /// Milliseconds spent in the network path before the error surfaced.
    pub fn network_time_ms(&self) -> u64 {
        match self {
            Self::Timeout { network_time_ms }
            | Self::NoConnection { network_time_ms, .. }
            | Self::Network { network_time_ms, .. }
            | Self::Server { network_time_ms, .. }
            | Self::Request { network_time_ms, .. }
            | Self::AuthFailure { network_time_ms, .. }
            | Self::Forbidden { network_time_ms, .. }
            | Self::Parse { network_time_ms, .. } => *network_time_ms,
            Self::BadUrl { .. } | Self::Config { .. } => 0,
        }
    }
}
