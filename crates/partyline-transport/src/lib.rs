//! Connections for partyline: one TCP stream plus one UDP address per peer.
//!
//! A [`Connection`] carries commands over two channels:
//!
//! - [`Channel::Reliable`](partyline_protocol::Channel::Reliable): the TCP
//!   stream, ordered and lossless, written by a single writer task;
//! - [`Channel::Unreliable`](partyline_protocol::Channel::Unreliable): UDP,
//!   one frame per datagram, fire-and-forget.
//!
//! Clients create connections with [`Connection::new`] and
//! [`Connection::connect`]; servers wrap accepted streams with
//! [`Connection::accept`]. Both sides can run pings (round-trip samples) and
//! keepalives (liveness deadline) on a [`RepeatingTimer`].

mod client;
mod config;
mod connection;
mod error;
mod io;
mod timer;

pub use config::{ClientConfig, ConnectionConfig, ConnectionState};
pub use connection::{Commands, Connection, ConnectionHooks, DisconnectHook, PingObserver, UdpAddressHook};
pub use error::ConnectionError;
pub use timer::{RepeatingTimer, TimerFlow};
