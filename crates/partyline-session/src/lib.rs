//! Sessions for partyline: named groups of connections.
//!
//! A [`Session`] owns a command registry that its members dispatch through,
//! an ordered member list, join/leave callbacks, and named repeating timers
//! for periodic logic. Broadcasts pick members with a
//! [`Recipient`](partyline_protocol::Recipient) and encode the frame once.
//!
//! ```text
//! Lobby (above)       ← moves connections between sessions
//!     ↕
//! Session (this crate) ← membership, broadcast, per-session commands
//!     ↕
//! Transport (below)   ← Connection, RepeatingTimer
//! ```

mod error;
mod session;

pub use error::SessionError;
pub use session::{MembershipCallback, Session, SessionId};
