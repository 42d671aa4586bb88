//! The lobby: owns the server and decides which session each client is in.
//!
//! Every admitted connection joins the *current* session. Moving clients
//! between sessions is a leave followed by a join, done while the lobby
//! holds its placement lock, so nothing asking the lobby ever sees a client
//! in no session or in two.
//!
//! Join and leave callbacks run while that lock is held. They may
//! broadcast and send freely, but must not call back into the lobby:
//! [`Lobby::session_of`], [`Lobby::move_client`] and [`Lobby::move_all`]
//! all take the same lock and would deadlock. Disconnecting a client from a
//! callback deadlocks the same way. The callback's `Session` argument
//! already says where the client is.
//!
//! A move the target session refuses puts the client back into its source
//! session, which runs the source's leave and join callbacks once more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use partyline_protocol::ConnectionId;
use partyline_session::Session;
use partyline_transport::{Connection, ConnectionError};
use tracing::{debug, info, warn};

use crate::{PartylineError, Server};

struct LobbyInner {
    server: Server,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    current: RwLock<Arc<Session>>,
    /// Which session each client is in, by name.
    placement: Mutex<HashMap<ConnectionId, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A handle to the lobby. Clones share the same lobby.
#[derive(Clone)]
pub struct Lobby {
    inner: Arc<LobbyInner>,
}

impl Lobby {
    /// Takes over the server's connect/disconnect hooks.
    ///
    /// `initial` becomes both the first registered session and the current
    /// one.
    pub fn new(server: Server, initial: Arc<Session>) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(initial.name().to_owned(), Arc::clone(&initial));
        let inner = Arc::new(LobbyInner {
            server,
            sessions: RwLock::new(sessions),
            current: RwLock::new(initial),
            placement: Mutex::new(HashMap::new()),
        });

        let on_connect: Weak<LobbyInner> = Arc::downgrade(&inner);
        inner.server.on_client_connect(move |connection| {
            if let Some(lobby) = on_connect.upgrade() {
                lobby.place_new_client(connection);
            }
        });
        let on_disconnect: Weak<LobbyInner> = Arc::downgrade(&inner);
        inner
            .server
            .on_client_disconnect(move |connection, reason| {
                if let Some(lobby) = on_disconnect.upgrade() {
                    lobby.release_client(connection, reason);
                }
            });

        Self { inner }
    }

    pub fn server(&self) -> &Server {
        &self.inner.server
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Registers another session under its name.
    pub fn add_session(&self, session: Arc<Session>) -> Result<(), PartylineError> {
        let mut sessions = self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let name = session.name().to_owned();
        if sessions.contains_key(&name) {
            return Err(PartylineError::DuplicateSession(name));
        }
        debug!(session = %name, id = %session.id(), "session added");
        sessions.insert(name, session);
        Ok(())
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of every registered session, sorted.
    pub fn session_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The session new clients join.
    pub fn current_session(&self) -> Arc<Session> {
        Arc::clone(&self.inner.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Makes `name` the session new clients join. Existing clients stay
    /// where they are; use [`move_all`](Self::move_all) to bring them.
    pub fn switch_current_session(&self, name: &str) -> Result<(), PartylineError> {
        let session = self
            .session(name)
            .ok_or_else(|| PartylineError::UnknownSession(name.to_owned()))?;
        *self.inner.current.write().unwrap_or_else(PoisonError::into_inner) = session;
        info!(session = %name, "current session switched");
        Ok(())
    }

    /// The session a client is in.
    ///
    /// Blocks while a move is in progress. Must not be called from a join
    /// or leave callback.
    pub fn session_of(&self, id: ConnectionId) -> Option<Arc<Session>> {
        let name = lock(&self.inner.placement).get(&id).cloned()?;
        self.session(&name)
    }

    // -----------------------------------------------------------------------
    // Moving clients
    // -----------------------------------------------------------------------

    /// Moves one client into the session named `to`.
    ///
    /// Moving a client into the session it is already in does nothing.
    pub fn move_client(&self, id: ConnectionId, to: &str) -> Result<(), PartylineError> {
        let target = self
            .session(to)
            .ok_or_else(|| PartylineError::UnknownSession(to.to_owned()))?;
        let mut placement = lock(&self.inner.placement);
        let from = placement.get(&id).cloned().ok_or(PartylineError::UnknownClient(id))?;
        if from == to {
            return Ok(());
        }
        let source = self
            .session(&from)
            .ok_or_else(|| PartylineError::UnknownSession(from.clone()))?;
        let connection = source.member(id).ok_or(PartylineError::UnknownClient(id))?;

        self.inner.transfer(&mut placement, &connection, &source, &target)
    }

    /// Moves every client of `from` into `to`. Returns how many moved.
    pub fn move_all(&self, from: &str, to: &str) -> Result<usize, PartylineError> {
        let source = self
            .session(from)
            .ok_or_else(|| PartylineError::UnknownSession(from.to_owned()))?;
        let target = self
            .session(to)
            .ok_or_else(|| PartylineError::UnknownSession(to.to_owned()))?;
        if from == to {
            return Ok(0);
        }

        let mut placement = lock(&self.inner.placement);
        let members = source.members();
        for connection in &members {
            self.inner.transfer(&mut placement, connection, &source, &target)?;
        }
        info!(from = %from, to = %to, moved = members.len(), "moved all clients");
        Ok(members.len())
    }

    /// Disconnects every client and stops the server.
    pub async fn stop(&self) {
        self.inner.server.stop().await;
        for name in self.session_names() {
            if let Some(session) = self.session(&name) {
                session.stop_all_timers();
            }
        }
    }
}

impl LobbyInner {
    fn place_new_client(&self, connection: &Connection) {
        let session = Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner));
        let mut placement = lock(&self.placement);
        match session.receive_new_client(connection) {
            Ok(()) => {
                placement.insert(connection.id(), session.name().to_owned());
            }
            Err(e) => warn!(conn = %connection.id(), session = %session.name(), error = %e, "failed to place client"),
        }
    }

    fn release_client(&self, connection: &Connection, reason: Option<&ConnectionError>) {
        let mut placement = lock(&self.placement);
        let Some(name) = placement.remove(&connection.id()) else {
            return;
        };
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();
        if let Some(session) = session {
            if let Err(e) = session.client_disconnect(connection) {
                warn!(conn = %connection.id(), session = %name, error = %e, "failed to release client");
            }
        }
        debug!(conn = %connection.id(), session = %name, lost = reason.is_some(), "client released");
    }

    /// Leave then join. Caller holds the placement lock.
    fn transfer(
        &self,
        placement: &mut HashMap<ConnectionId, String>,
        connection: &Connection,
        source: &Session,
        target: &Session,
    ) -> Result<(), PartylineError> {
        let id = connection.id();
        source.client_disconnect(connection)?;
        if let Err(e) = target.receive_new_client(connection) {
            // Put it back so the client is never left without a session.
            if let Err(rollback) = source.receive_new_client(connection) {
                warn!(conn = %id, session = %source.name(), error = %rollback, "failed to return client after refused move");
                placement.remove(&id);
            }
            warn!(conn = %id, from = %source.name(), to = %target.name(), error = %e, "move refused");
            return Err(e.into());
        }
        placement.insert(id, target.name().to_owned());
        debug!(conn = %id, from = %source.name(), to = %target.name(), "client moved");
        Ok(())
    }
}

impl std::fmt::Debug for Lobby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lobby")
            .field("current", &self.current_session().name())
            .field("sessions", &self.session_names())
            .finish()
    }
}
