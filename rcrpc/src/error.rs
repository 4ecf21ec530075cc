//! Error types for rcrpc.

use std::fmt;

use thiserror::Error;
use verbs::WcStatus;

/// Which half of a call a serialization failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Error type for rcrpc operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error from the bootstrap channel or the verbs layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed or rejected handshake.
    #[error("handshake error: {0}")]
    Handshake(String),
    /// Request payload larger than `max_request_payload`.
    #[error("request of {len} bytes exceeds limit of {max}")]
    RequestTooLarge { len: usize, max: usize },
    /// Response larger than the caller's buffer.
    #[error("response of {len} bytes does not fit buffer of {capacity}")]
    ResponseTooLarge { len: usize, capacity: usize },
    /// A work request completed with an error status.
    #[error("work request {wr_id} completed with {status}")]
    Completion { status: WcStatus, wr_id: u64 },
    /// The peer went away or the endpoint was shut down.
    #[error("connection closed")]
    ConnectionClosed,
    /// The acceptor was closed.
    #[error("acceptor closed")]
    Closed,
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A typed value could not be serialized.
    #[error("failed to encode {direction}: {source}")]
    Encode {
        direction: Direction,
        #[source]
        source: postcard::Error,
    },
    /// A typed value could not be deserialized.
    #[error("failed to decode {direction}: {source}")]
    Decode {
        direction: Direction,
        #[source]
        source: postcard::Error,
    },
    /// Feature exists in the API but is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A server worker panicked.
    #[error("server worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Result type alias for rcrpc operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a failed work completion, treating a flush as a closed connection.
    pub(crate) fn from_completion(status: WcStatus, wr_id: u64) -> Self {
        match status {
            WcStatus::WrFlushErr | WcStatus::RetryExcErr => Error::ConnectionClosed,
            status => Error::Completion { status, wr_id },
        }
    }
}
