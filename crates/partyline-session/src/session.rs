//! The session: an ordered group of connections sharing a command registry.
//!
//! Membership lives behind one mutex. Joining, leaving, and broadcasting all
//! take it, so a broadcast never delivers to a connection that is halfway
//! through leaving. Sends only enqueue (stream) or `try_send_to` (datagram),
//! so holding the lock across a broadcast never blocks on the network.
//!
//! Join and leave callbacks run after the lock is released. They may
//! broadcast to the session they were called from.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use partyline_protocol::{Channel, CommandArgs, ConnectionId, Recipient, SerialRegistry, Value};
use partyline_transport::{Commands, Connection, RepeatingTimer, TimerFlow};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SessionError;

/// Called with the session and the connection that joined or left.
pub type MembershipCallback = Arc<dyn Fn(&Session, &Connection) + Send + Sync>;

/// Random identifier of a session, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::rng().random())
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{:016x}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named group of connections.
///
/// Always handled as `Arc<Session>`: the lobby, callbacks, and timer tasks
/// all refer to the same instance.
pub struct Session {
    id: SessionId,
    name: String,
    me: Weak<Session>,
    serial: Arc<SerialRegistry>,
    commands: Arc<Commands>,
    members: Mutex<Vec<Connection>>,
    on_join: RwLock<Option<MembershipCallback>>,
    on_leave: RwLock<Option<MembershipCallback>>,
    timers: Mutex<HashMap<&'static str, RepeatingTimer>>,
}

impl Session {
    /// Creates an empty session with its own command registry.
    ///
    /// `serial` should be the registry the rest of the process uses, so
    /// message types registered once work in every session.
    pub fn new(name: impl Into<String>, serial: Arc<SerialRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: SessionId::random(),
            name: name.into(),
            me: me.clone(),
            serial,
            commands: Arc::new(Commands::new()),
            members: Mutex::new(Vec::new()),
            on_join: RwLock::new(None),
            on_leave: RwLock::new(None),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registry members dispatch through while they are in this session.
    pub fn commands(&self) -> &Arc<Commands> {
        &self.commands
    }

    pub fn serializer(&self) -> &Arc<SerialRegistry> {
        &self.serial
    }

    /// Installs the callback run after a connection joins.
    pub fn on_join<F>(&self, callback: F)
    where
        F: Fn(&Session, &Connection) + Send + Sync + 'static,
    {
        *self.on_join.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Installs the callback run after a connection leaves.
    pub fn on_leave<F>(&self, callback: F)
    where
        F: Fn(&Session, &Connection) + Send + Sync + 'static,
    {
        *self.on_leave.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Adds a connection and points its dispatch at this session's registry.
    pub fn receive_new_client(&self, connection: &Connection) -> Result<(), SessionError> {
        let id = connection.id();
        {
            let mut members = lock(&self.members);
            if members.iter().any(|m| m.id() == id) {
                return Err(SessionError::AlreadyMember(id));
            }
            members.push(connection.clone());
            connection.set_command_registry(Arc::clone(&self.commands));
        }
        info!(session = %self.name, conn = %id, "client joined");

        let callback = self.on_join.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(self, connection);
        }
        Ok(())
    }

    /// Removes a connection and runs the leave callback.
    pub fn client_disconnect(&self, connection: &Connection) -> Result<(), SessionError> {
        let id = connection.id();
        {
            let mut members = lock(&self.members);
            let index = members
                .iter()
                .position(|m| m.id() == id)
                .ok_or(SessionError::NotMember(id))?;
            members.remove(index);
        }
        info!(session = %self.name, conn = %id, "client left");

        let callback = self.on_leave.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(self, connection);
        }
        Ok(())
    }

    /// Members in join order.
    pub fn members(&self) -> Vec<Connection> {
        lock(&self.members).clone()
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        lock(&self.members).iter().map(Connection::id).collect()
    }

    pub fn member(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.members).iter().find(|m| m.id() == id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.members).iter().any(|m| m.id() == id)
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Sends a command to the selected members.
    ///
    /// The frame is encoded once. Returns how many members it was handed
    /// to; members that fail are logged and skipped.
    pub fn send_command<A: CommandArgs>(
        &self,
        recipient: Recipient,
        channel: Channel,
        alias: &str,
        args: A,
    ) -> Result<usize, SessionError> {
        let frame = self.commands.encode_command(alias, args, &self.serial)?;
        Ok(self.deliver(recipient, channel, alias, &frame))
    }

    /// Like [`send_command`](Self::send_command) with raw values.
    pub fn send_values(
        &self,
        recipient: Recipient,
        channel: Channel,
        alias: &str,
        values: &[Value],
    ) -> Result<usize, SessionError> {
        let frame = self.commands.encode_values(alias, values, &self.serial)?;
        Ok(self.deliver(recipient, channel, alias, &frame))
    }

    fn deliver(&self, recipient: Recipient, channel: Channel, alias: &str, frame: &[u8]) -> usize {
        let members = lock(&self.members);
        let mut delivered = 0;
        for member in members.iter().filter(|m| recipient.includes(m.id())) {
            match member.send_frame(channel, frame.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        session = %self.name,
                        conn = %member.id(),
                        %alias,
                        %channel,
                        error = %e,
                        "broadcast to member failed"
                    );
                }
            }
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Runs `tick` every `interval` until stopped or it returns
    /// [`TimerFlow::Stop`].
    ///
    /// One timer per `kind`. Returns `false` if a timer of that kind is
    /// already running. Must be called from within a Tokio runtime.
    pub fn start_timer<F>(&self, kind: &'static str, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut(&Session) -> TimerFlow + Send + 'static,
    {
        let mut timers = lock(&self.timers);
        if timers.get(kind).is_some_and(|timer| !timer.is_finished()) {
            return false;
        }

        let me = self.me.clone();
        let timer = RepeatingTimer::spawn(kind, interval, move || match me.upgrade() {
            Some(session) => tick(&session),
            None => TimerFlow::Stop,
        });
        timers.insert(kind, timer);
        debug!(session = %self.name, timer = kind, ?interval, "session timer started");
        true
    }

    /// Stops the timer of the given kind. Returns `true` if it was running.
    pub fn stop_timer(&self, kind: &str) -> bool {
        let timer = lock(&self.timers).remove(kind);
        let was_running = timer.as_ref().is_some_and(|timer| !timer.is_finished());
        if was_running {
            debug!(session = %self.name, timer = kind, "session timer stopped");
        }
        was_running
    }

    pub fn is_timer_running(&self, kind: &str) -> bool {
        lock(&self.timers).get(kind).is_some_and(|timer| !timer.is_finished())
    }

    /// Stops every timer of this session.
    pub fn stop_all_timers(&self) {
        let timers = std::mem::take(&mut *lock(&self.timers));
        drop(timers);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.member_ids())
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use partyline_transport::ClientConfig;

    use super::*;

    fn offline() -> Connection {
        Connection::new(ClientConfig::default())
    }

    // =========================================================================
    // Membership
    // =========================================================================

    #[test]
    fn test_new_session_is_empty() {
        let session = Session::new("lobby", Arc::new(SerialRegistry::new()));
        assert_eq!(session.name(), "lobby");
        assert!(session.is_empty());
        assert!(session.commands().is_empty());
    }

    #[test]
    fn test_session_ids_are_random() {
        let serial = Arc::new(SerialRegistry::new());
        let a = Session::new("a", Arc::clone(&serial));
        let b = Session::new("b", serial);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("session-"));
    }

    #[test]
    fn test_join_points_connection_at_session_registry() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        session.commands().register_alias::<(u32,)>("score").unwrap();
        let conn = offline();

        session.receive_new_client(&conn).unwrap();
        assert!(conn.commands().contains("score"));
        assert!(session.contains(conn.id()));
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_join_twice_is_rejected() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        let conn = offline();
        session.receive_new_client(&conn).unwrap();
        assert!(matches!(
            session.receive_new_client(&conn),
            Err(SessionError::AlreadyMember(_))
        ));
    }

    #[test]
    fn test_leave_unknown_is_not_member() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        assert!(matches!(
            session.client_disconnect(&offline()),
            Err(SessionError::NotMember(_))
        ));
    }

    #[test]
    fn test_callbacks_run_once_per_change() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        let joins = Arc::new(AtomicUsize::new(0));
        let leaves = Arc::new(AtomicUsize::new(0));
        let j = Arc::clone(&joins);
        let l = Arc::clone(&leaves);
        session.on_join(move |session, _conn| {
            // The lock is released, so reading membership here is fine.
            assert_eq!(session.len(), 1);
            j.fetch_add(1, Ordering::SeqCst);
        });
        session.on_leave(move |session, _conn| {
            assert!(session.is_empty());
            l.fetch_add(1, Ordering::SeqCst);
        });

        let conn = offline();
        session.receive_new_client(&conn).unwrap();
        session.client_disconnect(&conn).unwrap();
        let _ = session.client_disconnect(&conn);

        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    #[test]
    fn test_broadcast_unregistered_alias_errors() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        let err = session
            .send_command(Recipient::All, Channel::Reliable, "nope", ())
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_broadcast_skips_failing_members() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        session.commands().register_alias::<()>("tick").unwrap();
        session.receive_new_client(&offline()).unwrap();

        // The offline member fails, which is logged and not an error.
        let delivered = session
            .send_command(Recipient::All, Channel::Reliable, "tick", ())
            .unwrap();
        assert_eq!(delivered, 0);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_timer_start_stop_is_idempotent() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);

        assert!(session.start_timer("score", Duration::from_millis(100), move |_session| {
            t.fetch_add(1, Ordering::SeqCst);
            TimerFlow::Continue
        }));
        assert!(!session.start_timer("score", Duration::from_millis(100), |_| TimerFlow::Continue));
        assert!(session.is_timer_running("score"));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(session.stop_timer("score"));
        assert!(!session.stop_timer("score"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_when_session_dropped() {
        let session = Session::new("round", Arc::new(SerialRegistry::new()));
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        session.start_timer("score", Duration::from_millis(10), move |_| {
            t.fetch_add(1, Ordering::SeqCst);
            TimerFlow::Continue
        });
        drop(session);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
