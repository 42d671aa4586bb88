//! Wire frames: command invocations and control messages.
//!
//! Every frame starts with a 16-byte id. Command frames follow it with the
//! encoded arguments, nothing else: the receiver's descriptor says how many
//! there are. Control frames use a small reserved id block and carry fixed
//! payloads:
//!
//! | Kind          | Payload                                   |
//! |---------------|-------------------------------------------|
//! | `Ping`        | `u64` sender timestamp (nanoseconds)      |
//! | `PingEcho`    | the same `u64`, returned unchanged        |
//! | `KeepAlive`   | none                                      |
//! | `Identify`    | `ConnectionId` (16 bytes) + `u16` UDP port |
//! | `AnnounceUdp` | `u16` UDP port                            |
//! | `Goodbye`     | none                                      |
//!
//! On the stream frames are simply concatenated. [`decode_frame`] reports how
//! many bytes it consumed, or [`ProtocolError::TruncatedFrame`] when the
//! buffer does not hold a whole frame yet. On datagrams each frame is exactly
//! one datagram and [`decode_datagram`] rejects leftovers.

use crate::bytes::{ByteReader, WriteExt};
use crate::command::CommandRegistry;
use crate::error::ProtocolError;
use crate::serial::SerialRegistry;
use crate::types::{CommandId, ConnectionId};
use crate::value::Value;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

// ---------------------------------------------------------------------------
// Control frames
// ---------------------------------------------------------------------------

/// The reserved control frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Ping = 1,
    PingEcho = 2,
    KeepAlive = 3,
    Identify = 4,
    AnnounceUdp = 5,
    Goodbye = 6,
}

impl ControlKind {
    /// The reserved command id for this kind.
    pub const fn id(self) -> CommandId {
        CommandId::reserved(self as u8)
    }

    fn from_id(id: CommandId) -> Option<Self> {
        if !id.is_reserved() {
            return None;
        }
        match id.as_bytes()[15] {
            1 => Some(Self::Ping),
            2 => Some(Self::PingEcho),
            3 => Some(Self::KeepAlive),
            4 => Some(Self::Identify),
            5 => Some(Self::AnnounceUdp),
            6 => Some(Self::Goodbye),
            _ => None,
        }
    }
}

/// A decoded control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Round-trip probe. The peer answers with [`ControlFrame::PingEcho`].
    Ping { sent_nanos: u64 },
    PingEcho { sent_nanos: u64 },
    /// Liveness only.
    KeepAlive,
    /// First frame the server writes on a new stream.
    Identify {
        connection_id: ConnectionId,
        udp_port: u16,
    },
    /// The client's UDP port; the server pairs it with the stream's peer IP.
    AnnounceUdp { port: u16 },
    /// The sender is closing on purpose.
    Goodbye,
}

impl ControlFrame {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlFrame::Ping { .. } => ControlKind::Ping,
            ControlFrame::PingEcho { .. } => ControlKind::PingEcho,
            ControlFrame::KeepAlive => ControlKind::KeepAlive,
            ControlFrame::Identify { .. } => ControlKind::Identify,
            ControlFrame::AnnounceUdp { .. } => ControlKind::AnnounceUdp,
            ControlFrame::Goodbye => ControlKind::Goodbye,
        }
    }

    /// Encodes the full frame, id included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CommandId::LEN + 18);
        out.extend_from_slice(self.kind().id().as_bytes());
        match self {
            ControlFrame::Ping { sent_nanos } | ControlFrame::PingEcho { sent_nanos } => {
                out.put_u64(*sent_nanos);
            }
            ControlFrame::Identify {
                connection_id,
                udp_port,
            } => {
                out.extend_from_slice(&connection_id.to_bytes());
                out.put_u16(*udp_port);
            }
            ControlFrame::AnnounceUdp { port } => out.put_u16(*port),
            ControlFrame::KeepAlive | ControlFrame::Goodbye => {}
        }
        out
    }

    fn decode_payload(kind: ControlKind, reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(match kind {
            ControlKind::Ping => ControlFrame::Ping {
                sent_nanos: reader.read_u64()?,
            },
            ControlKind::PingEcho => ControlFrame::PingEcho {
                sent_nanos: reader.read_u64()?,
            },
            ControlKind::KeepAlive => ControlFrame::KeepAlive,
            ControlKind::Identify => ControlFrame::Identify {
                connection_id: ConnectionId::from_bytes(reader.read_array()?),
                udp_port: reader.read_u16()?,
            },
            ControlKind::AnnounceUdp => ControlFrame::AnnounceUdp {
                port: reader.read_u16()?,
            },
            ControlKind::Goodbye => ControlFrame::Goodbye,
        })
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One decoded frame.
#[derive(Debug)]
pub enum Frame {
    /// A command with its arguments, decoded against the receiver's
    /// descriptor.
    Command { id: CommandId, args: Vec<Value> },
    Control(ControlFrame),
}

/// Decodes the first frame in `buf`.
///
/// Returns the frame and the number of bytes it occupied. Bytes after it are
/// left for the next call. [`ProtocolError::TruncatedFrame`] means `buf`
/// holds only a prefix of a frame; every other error means the input is
/// corrupt or was produced with different registrations.
pub fn decode_frame<C: 'static>(
    buf: &[u8],
    commands: &CommandRegistry<C>,
    serial: &SerialRegistry,
) -> Result<(Frame, usize), ProtocolError> {
    let mut reader = ByteReader::new(buf);
    let id = CommandId::from_bytes(reader.read_array()?);

    let frame = if id.is_reserved() {
        let kind = ControlKind::from_id(id).ok_or(ProtocolError::UnknownCommand(id))?;
        Frame::Control(ControlFrame::decode_payload(kind, &mut reader)?)
    } else {
        let args = commands.decode_arguments(id, &mut reader, serial)?;
        Frame::Command { id, args }
    };
    Ok((frame, reader.position()))
}

/// Decodes a datagram that must contain exactly one frame.
pub fn decode_datagram<C: 'static>(
    datagram: &[u8],
    commands: &CommandRegistry<C>,
    serial: &SerialRegistry,
) -> Result<Frame, ProtocolError> {
    let (frame, consumed) = decode_frame(datagram, commands, serial)?;
    if consumed != datagram.len() {
        return Err(ProtocolError::Malformed(format!(
            "datagram has {} trailing bytes",
            datagram.len() - consumed
        )));
    }
    Ok(frame)
}
