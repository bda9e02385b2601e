use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Flag evaluation never returns an error: evaluation entry points degrade to the caller-supplied
/// default. These errors are only returned by lifecycle calls (e.g.,
/// [`Client::wait_for_initialization`](crate::Client::wait_for_initialization)) and by
/// [`Storage`](crate::Storage) implementations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Authentication exhausted its retries or was rejected with a non-retryable error. The
    /// client keeps serving default values.
    #[error("client initialization failed: {0}")]
    InitializationFailed(String),

    /// The client did not become ready within the requested time.
    #[error("timed out waiting for client initialization")]
    InitializationTimeout,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// Error returned by the connector.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Error returned by a durable store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Failed to (de)serialize a persisted record.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

/// Errors reported by a [`Connector`](crate::Connector) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectorError {
    /// The remote service rejected the credential (or the SDK key).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote service answered with a non-success status.
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never reached the remote service or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The remote service does not implement the requested endpoint.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ConnectorError {
    /// Returns `true` if the remote service signalled that the current credential is not
    /// accepted.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Http { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }

    /// Returns `true` if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => {
                matches!(*status, 408 | 425 | 429) || (*status >= 500 && *status != 501)
            }
            Self::Unauthorized(_) | Self::NotImplemented(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Returns `true` if the server rejected the stream in a way reconnecting cannot fix.
    pub fn is_unrecoverable_stream_failure(&self) -> bool {
        match self {
            Self::NotImplemented(_) => true,
            Self::Http { status, .. } => *status == 501,
            _ => false,
        }
    }
}
