//! Identity and routing types shared by every partyline layer.
//!
//! Everything here is small, `Copy` where possible, and cheap to hash, because
//! these values are used as map keys on every received frame.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies one logical connection (a TCP stream plus a UDP address).
///
/// The server assigns it at accept time and tells the client through the
/// Identify control frame, so both ends agree on it. It is a random 128-bit
/// value: unguessable and effectively collision-free, even across restarts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(u128);

impl ConnectionId {
    /// The all-zero id. A client holds it until the server identifies it.
    pub const NIL: ConnectionId = ConnectionId(0);

    /// Creates a `ConnectionId` from a raw value.
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self(u128::from_be_bytes(bytes))
    }

    /// Returns the underlying value.
    pub fn into_inner(self) -> u128 {
        self.0
    }

    /// Big-endian wire representation.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Parses the big-endian wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:032x}", self.0)
    }
}

/// The 128-bit wire identifier of a command.
///
/// Ids are derived from the alias: the first 16 bytes of the BLAKE3 hash of
/// its UTF-8 bytes. Both ends compute the same id from the same alias without
/// any negotiation, so registration order never matters.
///
/// A small block of ids (fifteen zero bytes followed by a kind byte) is
/// reserved for control frames; see [`ControlKind`](crate::ControlKind).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId([u8; 16]);

impl CommandId {
    /// Length of a command id on the wire.
    pub const LEN: usize = 16;

    /// Derives the id for an alias.
    pub fn from_alias(alias: &str) -> Self {
        let hash = blake3::hash(alias.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash.as_bytes()[..16]);
        Self(id)
    }

    /// Wraps raw wire bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw wire bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Builds one of the reserved control ids.
    pub(crate) const fn reserved(kind: u8) -> Self {
        let mut id = [0u8; 16];
        id[15] = kind;
        Self(id)
    }

    /// Whether this id falls inside the reserved control block.
    pub fn is_reserved(&self) -> bool {
        self.0[..15].iter().all(|b| *b == 0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({self})")
    }
}

/// The 64-bit wire identifier of a user message type.
///
/// Derived from the type's registered name the same way [`CommandId`] is
/// derived from an alias, so peers that register the same names agree on ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeId(u64);

impl MessageTypeId {
    /// Derives the id for a registered type name.
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_be_bytes(id))
    }

    /// Wraps a raw id read from the wire.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type-{:016x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Recipient: who should receive a command?
// ---------------------------------------------------------------------------

/// Selects which members of a group receive a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Every member.
    All,

    /// Exactly one member.
    Connection(ConnectionId),

    /// Every member except one; typically the sender of the update being
    /// relayed, so it never receives its own echo.
    AllExcept(ConnectionId),
}

impl Recipient {
    /// Whether a member with the given id is selected.
    pub fn includes(&self, id: ConnectionId) -> bool {
        match self {
            Recipient::All => true,
            Recipient::Connection(target) => *target == id,
            Recipient::AllExcept(excluded) => *excluded != id,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel: delivery guarantees
// ---------------------------------------------------------------------------

/// Which transport a command travels on.
///
/// A chat message must arrive, so it goes over the reliable stream. A
/// position update sent many times per second can afford to lose a few, so
/// it goes over datagrams where a lost packet never stalls the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Channel {
    /// Delivered in order, no loss. TCP.
    #[default]
    Reliable,

    /// May be lost, duplicated, or reordered. UDP, one frame per datagram.
    Unreliable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Reliable => f.write_str("tcp"),
            Channel::Unreliable => f.write_str("udp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    // =====================================================================
    // ConnectionId
    // =====================================================================

    #[test]
    fn test_connection_id_random_is_unique() {
        let ids: HashSet<ConnectionId> = (0..64).map(|_| ConnectionId::random()).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_connection_id_bytes_roundtrip() {
        let id = ConnectionId::new(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        assert_eq!(ConnectionId::from_bytes(id.to_bytes()), id);
        assert_eq!(id.to_bytes()[0], 0x01);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), format!("conn-{}7", "0".repeat(31)));
    }

    #[test]
    fn test_connection_id_serializes_transparently() {
        let json = serde_json::to_string(&ConnectionId::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    // =====================================================================
    // CommandId
    // =====================================================================

    #[test]
    fn test_command_id_is_deterministic() {
        assert_eq!(CommandId::from_alias("order"), CommandId::from_alias("order"));
        assert_ne!(CommandId::from_alias("order"), CommandId::from_alias("orders"));
    }

    #[test]
    fn test_command_id_reserved_block() {
        assert!(CommandId::reserved(1).is_reserved());
        assert!(!CommandId::from_alias("ping").is_reserved());
    }

    #[test]
    fn test_message_type_id_from_name_is_deterministic() {
        assert_eq!(
            MessageTypeId::from_name("ChatMessage"),
            MessageTypeId::from_name("ChatMessage")
        );
        assert_ne!(
            MessageTypeId::from_name("ChatMessage"),
            MessageTypeId::from_name("Position")
        );
    }

    // =====================================================================
    // Recipient / Channel
    // =====================================================================

    #[test]
    fn test_recipient_includes() {
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        assert!(Recipient::All.includes(a));
        assert!(Recipient::Connection(a).includes(a));
        assert!(!Recipient::Connection(a).includes(b));
        assert!(!Recipient::AllExcept(a).includes(a));
        assert!(Recipient::AllExcept(a).includes(b));
    }

    #[test]
    fn test_channel_default_is_reliable() {
        assert_eq!(Channel::default(), Channel::Reliable);
        assert_eq!(serde_json::to_string(&Channel::Unreliable).unwrap(), "\"Unreliable\"");
    }
}
