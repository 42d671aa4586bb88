//! # partyline
//!
//! Typed remote commands over a TCP + UDP pair per client, with sessions
//! that group clients and a lobby that moves them between sessions.
//!
//! Both ends register the same command aliases with the same argument
//! types. A command then travels as a 16-byte id and its arguments, on the
//! reliable stream or as a single datagram.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use partyline::prelude::*;
//!
//! # async fn run() -> Result<(), PartylineError> {
//! let server = Server::new(ServerConfig::new("127.0.0.1", 19999));
//! let arena = Session::new("arena", Arc::clone(server.serializer()));
//! arena.commands().register_command("moved", |conn: &Connection, (x, y): (f32, f32)| {
//!     tracing::debug!(conn = %conn.id(), x, y, "moved");
//! })?;
//!
//! let lobby = Lobby::new(server.clone(), arena);
//! server.start().await?;
//! server.allow_clients();
//! # drop(lobby);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod lobby;
mod server;

pub use config::ServerConfig;
pub use error::PartylineError;
pub use lobby::Lobby;
pub use server::{ClientConnectHook, ClientDisconnectHook, Server};

pub use partyline_protocol as protocol;
pub use partyline_session as session;
pub use partyline_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{Lobby, PartylineError, Server, ServerConfig};
    pub use partyline_protocol::{
        Channel, CommandRegistry, ConnectionId, Message, MessageValue, ProtocolError, Recipient, SerialRegistry,
        Value,
    };
    pub use partyline_session::{Session, SessionError};
    pub use partyline_transport::{ClientConfig, Connection, ConnectionConfig, ConnectionError, TimerFlow};
}
