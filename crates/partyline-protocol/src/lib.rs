//! Wire protocol for partyline.
//!
//! This crate defines how peers turn typed command calls into bytes and back:
//!
//! - **Types** ([`ConnectionId`], [`CommandId`], [`Channel`], [`Recipient`]):
//!   identities and routing shared by every layer.
//! - **Values** ([`Value`], [`TypeTag`], [`Param`], [`Message`]): the
//!   dynamically typed argument model and its static adapters.
//! - **Serialization** ([`SerialRegistry`]): built-in encodings plus
//!   registered user types.
//! - **Commands** ([`CommandRegistry`]): alias → id → descriptor → handler.
//! - **Frames** ([`decode_frame`], [`ControlFrame`]): the byte layout of a
//!   command invocation and of the control messages.
//!
//! # Wire format
//!
//! All integers are big-endian. Strings are a `u32` byte length followed by
//! UTF-8; arrays are a `u32` element count followed by the elements; user
//! types are a `u64` type id, a `u32` body length, then the body.
//!
//! ```text
//! [command id: 16 bytes][arg 1][arg 2]...[arg N]
//! ```
//!
//! N is never on the wire: both peers register the same alias with the same
//! parameter types, and the receiver decodes exactly what its descriptor
//! says.
//!
//! # Architecture
//!
//! The protocol layer knows nothing about sockets. It sits between the
//! transport (raw bytes) and whatever owns the handler context:
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → handler(connection, args...)
//! ```

mod bytes;
mod command;
mod error;
mod frame;
mod serial;
mod types;
mod value;

pub use bytes::{ByteReader, WriteExt};
pub use command::{CommandArgs, CommandRegistry, ParameterDescriptor};
pub use error::ProtocolError;
pub use frame::{decode_datagram, decode_frame, ControlFrame, ControlKind, Frame, MAX_DATAGRAM_SIZE};
pub use serial::SerialRegistry;
pub use types::{Channel, CommandId, ConnectionId, MessageTypeId, Recipient};
pub use value::{Message, MessageValue, Param, TypeTag, Value};
