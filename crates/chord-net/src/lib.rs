//! Wire protocol and transport for chordstore.
//!
//! This crate implements the network layer on top of plain TCP:
//!
//! - [`ChordMessage`]: the wire protocol (postcard-serialized).
//! - [`TcpTransport`]: one connection per request, length-prefixed frames,
//!   a per-request deadline, and the accept loop that feeds a node's handler.
//! - [`Transport`]: the seam the engine talks through, so tests can swap in
//!   an in-process network.

mod error;
mod message;
mod transport;

use std::net::SocketAddr;

pub use error::NetError;
pub use message::ChordMessage;
pub use transport::TcpTransport;

/// Maximum accepted frame payload: 1 MiB.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Trait abstracting the network transport operations used by the engine.
///
/// This allows substituting an in-memory transport in tests (no sockets,
/// and nodes can be marked down to simulate crashes).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the single response message.
    ///
    /// Fails with [`NetError::Timeout`] when the remote does not answer
    /// within the transport's deadline.
    async fn request(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<ChordMessage, NetError>;

    /// Send a one-way message. Returns once the frame has been written.
    async fn send_to(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<(), NetError>;
}
