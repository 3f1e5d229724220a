//! Frame transport seam.
//!
//! The protocol engine only needs ordered, reliable delivery of whole binary
//! frames in both directions plus a way to close with a reason.

use crate::connection::CloseReason;
use async_trait::async_trait;
use thiserror::Error;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed, or the transport was already closed locally.
    #[error("transport closed{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed {
        /// Reason supplied by the peer, when it sent one.
        reason: Option<CloseReason>,
    },
    /// A frame exceeded the configured size limit.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
    /// QUIC connection failure.
    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),
    /// QUIC stream write failure.
    #[error(transparent)]
    Write(#[from] quinn::WriteError),
    /// QUIC stream read failure.
    #[error(transparent)]
    Read(#[from] quinn::ReadExactError),
}

/// Bidirectional frame pipe to one peer.
///
/// `send` and `receive` may be called concurrently from different tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Wait for the next frame.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    /// Close with a reason. Calling it on a closed transport does nothing.
    async fn close(&self, reason: &CloseReason);

    /// True once either side has closed.
    fn is_closed(&self) -> bool;

    /// Human-readable peer identity for logs.
    fn peer(&self) -> String;

    /// Largest frame `send` accepts, if the transport caps it.
    fn max_frame_len(&self) -> Option<usize> {
        None
    }
}
