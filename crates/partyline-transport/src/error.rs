//! Errors that can occur in the transport layer.

use std::time::Duration;

use partyline_protocol::ProtocolError;

/// Errors raised by a [`Connection`](crate::Connection).
///
/// Connect-time failures (`ConnectionRefused`, `Timeout`) are recoverable:
/// the connection returns to `Disconnected` and `connect()` may be retried.
/// `PeerTimeout`, framing errors on the stream, and I/O errors are terminal
/// for the connection and reach the owner through its disconnect hook.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A send or timer operation was attempted outside `Connected`.
    #[error("connection is not connected")]
    NotConnected,

    /// `connect()` was called while connecting or connected.
    #[error("connection is already connected or connecting")]
    AlreadyConnected,

    /// The remote host actively refused the stream.
    #[error("connection refused: {0}")]
    ConnectionRefused(#[source] std::io::Error),

    /// The connect attempt (including the handshake) did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Nothing was received from the peer within the keepalive deadline.
    #[error("peer timed out: nothing received for {0:?}")]
    PeerTimeout(Duration),

    /// The server did not open the stream with a valid Identify frame.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame exceeded the configured or transport limit.
    #[error("frame of {size} bytes exceeds the limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// An unreliable send was attempted before the peer's UDP address was
    /// known.
    #[error("no datagram route to peer yet")]
    NoDatagramRoute,

    /// The peer closed the stream, or a socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
