//! Unified error type for partyline.

use partyline_protocol::{ConnectionId, ProtocolError};
use partyline_session::SessionError;
use partyline_transport::ConnectionError;

/// Top-level error that wraps every layer's errors.
///
/// The `#[from]` variants let `?` convert sub-crate errors, so code using the
/// `partyline` crate only needs this one type.
#[derive(Debug, thiserror::Error)]
pub enum PartylineError {
    /// Encoding, decoding, or registration failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A connection-level failure (not connected, refused, timed out).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A session membership or broadcast failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The server could not bind its sockets.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called on a running server.
    #[error("server is already started")]
    AlreadyStarted,

    #[error("no session named {0:?}")]
    UnknownSession(String),

    #[error("a session named {0:?} already exists")]
    DuplicateSession(String),

    /// The connection is not known to the server or lobby.
    #[error("unknown client {0}")]
    UnknownClient(ConnectionId),
}
