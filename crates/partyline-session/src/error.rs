//! Error types for the session layer.

use partyline_protocol::{ConnectionId, ProtocolError};

/// Errors raised by a [`Session`](crate::Session).
///
/// Per-member delivery failures are not here: a broadcast logs them and
/// carries on with the remaining members.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Encoding a broadcast failed, usually an unregistered alias.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection is already a member of this session.
    #[error("{0} is already a member")]
    AlreadyMember(ConnectionId),

    /// The connection is not a member of this session.
    #[error("{0} is not a member")]
    NotMember(ConnectionId),
}
