//! Error types for the protocol layer.
//!
//! Each crate in partyline defines its own error enum. A `ProtocolError`
//! always means the problem is in serialization, framing, or command
//! lookup, never in the network itself.

use crate::types::{CommandId, MessageTypeId};

/// Errors that can occur while encoding, decoding, or dispatching commands.
///
/// The variants are split so callers can pick a policy: on the reliable
/// stream, [`TruncatedFrame`](Self::TruncatedFrame) means "wait for more
/// bytes" until the stream ends, while every other decode failure closes
/// the connection. On the datagram channel the whole datagram is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A send named an alias the registry has never seen.
    ///
    /// There is no default id: sending on an unknown alias always fails.
    #[error("command alias has not been registered: {0}")]
    UnregisteredAlias(String),

    /// A frame carried a message type id with no registered codec.
    #[error("unknown message type {0}")]
    UnknownType(MessageTypeId),

    /// A frame carried a command id with no registered descriptor.
    #[error("unknown command {0}")]
    UnknownCommand(CommandId),

    /// The alias is known for sending, but no handler was installed.
    #[error("no handler registered for command {0}")]
    NoHandler(String),

    /// The input ended before the frame was complete.
    ///
    /// `needed` is how many more bytes the reader wanted at the point it
    /// ran out, `remaining` is how many it had.
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    TruncatedFrame { needed: usize, remaining: usize },

    /// A message type (or its wire name) was registered twice.
    #[error("message type already registered: {0}")]
    DuplicateType(String),

    /// A second handler was registered for the same alias.
    #[error("command already has a handler: {0}")]
    DuplicateCommand(String),

    /// An alias was re-registered with a different parameter descriptor.
    #[error("command {alias} is already registered with a different descriptor")]
    DescriptorConflict { alias: String },

    /// The arguments supplied to a send or a handler do not match the
    /// registered descriptor.
    #[error("argument mismatch for command {alias}: {reason}")]
    ArgumentMismatch { alias: String, reason: String },

    /// A decoded value did not have the type its consumer expected.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// A string on the wire was not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// The bytes parse but violate the wire format.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// An alias hashed onto an id reserved for control frames.
    #[error("alias {0} maps onto a reserved control id")]
    ReservedCommandId(String),
}

impl ProtocolError {
    /// Whether the error only means "more input is required".
    ///
    /// Stream readers use this to keep buffering instead of closing.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::TruncatedFrame { .. })
    }

    /// For a truncation, how many more bytes must arrive before decoding
    /// can get further. At least 1.
    pub fn shortfall(&self) -> Option<usize> {
        match self {
            Self::TruncatedFrame { needed, remaining } => Some(needed.saturating_sub(*remaining).max(1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_alias_message_names_the_alias() {
        let err = ProtocolError::UnregisteredAlias("order".into());
        assert!(err.to_string().contains("order"));
    }

    #[test]
    fn test_is_truncated_only_for_truncation() {
        let truncated = ProtocolError::TruncatedFrame {
            needed: 4,
            remaining: 1,
        };
        assert!(truncated.is_truncated());
        assert!(!ProtocolError::InvalidUtf8.is_truncated());
        assert!(!ProtocolError::Malformed("x".into()).is_truncated());
    }

    #[test]
    fn test_shortfall_counts_missing_bytes() {
        let truncated = ProtocolError::TruncatedFrame {
            needed: 4096,
            remaining: 96,
        };
        assert_eq!(truncated.shortfall(), Some(4000));
        assert_eq!(ProtocolError::InvalidUtf8.shortfall(), None);
    }
}
