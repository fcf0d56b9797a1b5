//! Error types for network operations.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote endpoint.
    #[error("connection to {addr} failed: {reason}")]
    Connect {
        /// The endpoint we tried to reach.
        addr: SocketAddr,
        /// Underlying failure.
        reason: String,
    },

    /// The remote did not answer within the request deadline.
    #[error("request to {addr} timed out after {after:?}")]
    Timeout {
        /// The endpoint that did not answer.
        addr: SocketAddr,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// An I/O error on an established stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A frame exceeded the maximum message size.
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge {
        /// Announced frame length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// The remote closed the stream without answering.
    #[error("stream closed by {0} before a response arrived")]
    StreamClosed(SocketAddr),

    /// The endpoint is known to be unreachable (used by in-process transports).
    #[error("endpoint {0} unreachable")]
    Unreachable(SocketAddr),
}
