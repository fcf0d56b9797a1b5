//! TCP transport.
//!
//! Every request opens a fresh connection, writes one frame, reads one
//! frame back and closes. A frame is a 4-byte big-endian length followed by
//! the postcard-encoded [`ChordMessage`].

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::error::NetError;
use crate::message::ChordMessage;
use crate::{MAX_MESSAGE_SIZE, Transport};

/// Network transport for inter-node communication.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Deadline for a whole request: connect, send and receive.
    request_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport whose requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// The per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn connect(addr: SocketAddr) -> Result<TcpStream, NetError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        addr: SocketAddr,
        msg: &ChordMessage,
    ) -> Result<ChordMessage, NetError> {
        trace!(%addr, kind = msg.kind(), "sending request");
        let exchange = async {
            let mut stream = Self::connect(addr).await?;
            Self::send_message(&mut stream, msg).await?;
            match Self::recv_message(&mut stream).await {
                Err(NetError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    Err(NetError::StreamClosed(addr))
                }
                other => other,
            }
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                addr,
                after: self.request_timeout,
            }),
        }
    }

    /// Send a one-way message and close the connection.
    pub async fn send_to(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<(), NetError> {
        trace!(%addr, kind = msg.kind(), "sending one-way message");
        let exchange = async {
            let mut stream = Self::connect(addr).await?;
            Self::send_message(&mut stream, msg).await?;
            stream.shutdown().await?;
            Ok(())
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout {
                addr,
                after: self.request_timeout,
            }),
        }
    }

    // -------------------------------------------------------------------
    // Framing
    // -------------------------------------------------------------------

    /// Write one length-prefixed, postcard-encoded message.
    pub async fn send_message<W>(writer: &mut W, message: &ChordMessage) -> Result<(), NetError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                len: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed, postcard-encoded message.
    ///
    /// Frames announcing more than [`MAX_MESSAGE_SIZE`] bytes are rejected
    /// before the payload is read.
    pub async fn recv_message<R>(reader: &mut R) -> Result<ChordMessage, NetError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Incoming message handling
    // -------------------------------------------------------------------

    /// Accept connections forever, dispatching each incoming message to
    /// `handler` on its own task.
    ///
    /// When the handler returns `Some(response)` it is written back on the
    /// same connection. Frames that fail to decode are dropped with a
    /// warning and no reply.
    pub async fn serve<F, Fut>(listener: TcpListener, handler: F)
    where
        F: Fn(ChordMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ChordMessage>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    continue;
                }
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                Self::handle_connection(stream, peer, handler.as_ref()).await;
            });
        }
    }

    async fn handle_connection<F, Fut>(mut stream: TcpStream, peer: SocketAddr, handler: &F)
    where
        F: Fn(ChordMessage) -> Fut,
        Fut: Future<Output = Option<ChordMessage>>,
    {
        let request = match Self::recv_message(&mut stream).await {
            Ok(msg) => msg,
            Err(NetError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!(%peer, "connection closed before a full frame");
                return;
            }
            Err(e) => {
                warn!(%peer, "dropping malformed frame: {e}");
                return;
            }
        };

        trace!(%peer, kind = request.kind(), "received message");
        if let Some(response) = handler(request).await
            && let Err(e) = Self::send_message(&mut stream, &response).await
        {
            warn!(%peer, "failed to send response: {e}");
        }
        let _ = stream.shutdown().await;
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        addr: SocketAddr,
        msg: &ChordMessage,
    ) -> Result<ChordMessage, NetError> {
        TcpTransport::request(self, addr, msg).await
    }

    async fn send_to(&self, addr: SocketAddr, msg: &ChordMessage) -> Result<(), NetError> {
        TcpTransport::send_to(self, addr, msg).await
    }
}
