//! The connection handle: one peer, one TCP stream, one UDP address.
//!
//! A [`Connection`] is a cheap-to-clone handle (`Arc` inside). Clones are
//! handed to command handlers as their context, stored in session member
//! lists, and kept by the server's connection table. They all refer to the
//! same underlying connection.
//!
//! Tasks per connection:
//!
//! - a **writer** that owns the stream's write half and drains an unbounded
//!   queue, so reliable sends never interleave and never block the caller;
//! - a **stream reader** that decodes frames and dispatches commands;
//! - on the client only, a **datagram reader** on the client's own UDP
//!   socket (server-side datagrams arrive through the server's shared socket
//!   and are handed in via [`Connection::handle_datagram`]);
//! - optional **ping** and **keepalive** timers.
//!
//! Closing is a single atomic state transition, so the disconnect hook runs
//! exactly once no matter how many paths (peer EOF, keepalive timeout,
//! explicit `disconnect()`) race to close the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use partyline_protocol::{
    decode_datagram, Channel, CommandArgs, CommandRegistry, ConnectionId, ControlFrame, Frame, ProtocolError,
    SerialRegistry, Value, MAX_DATAGRAM_SIZE,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, ConnectionConfig, ConnectionState};
use crate::error::ConnectionError;
use crate::io;
use crate::timer::{RepeatingTimer, TimerFlow};

/// The command registry type connections dispatch through.
pub type Commands = CommandRegistry<Connection>;

/// Receives one round-trip sample per ping echo.
pub type PingObserver = Arc<dyn Fn(&Connection, Duration) + Send + Sync>;

/// Called when an accepted connection announces its UDP address.
pub type UdpAddressHook = Arc<dyn Fn(&Connection, SocketAddr) + Send + Sync>;

/// Called once when a connection closes. `None` means a clean close.
pub type DisconnectHook = Arc<dyn Fn(&Connection, Option<&ConnectionError>) + Send + Sync>;

/// Callbacks an owner (normally the server) installs on a connection.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_udp_address: Option<UdpAddressHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Live socket resources. Present only while connected.
pub(crate) struct Link {
    pub(crate) outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) udp: Arc<UdpSocket>,
    pub(crate) udp_peer: Option<SocketAddr>,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    /// Reader tasks, aborted on close. The writer is not here: it finishes
    /// on its own once the queue sender is dropped.
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) id: RwLock<ConnectionId>,
    /// `Some` for client-side connections.
    pub(crate) client: Option<ClientConfig>,
    pub(crate) config: ConnectionConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) serial: Arc<SerialRegistry>,
    pub(crate) commands: RwLock<Arc<Commands>>,
    pub(crate) link: Mutex<Option<Link>>,
    /// Read half of an accepted stream, waiting for [`Connection::start`].
    pub(crate) pending_read: Mutex<Option<OwnedReadHalf>>,
    pub(crate) hooks: RwLock<ConnectionHooks>,
    pub(crate) epoch: Instant,
    pub(crate) last_received: Mutex<Instant>,
    pub(crate) pings: Mutex<Option<RepeatingTimer>>,
    pub(crate) keepalives: Mutex<Option<RepeatingTimer>>,
    pub(crate) ping_observer: RwLock<Option<PingObserver>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to one logical peer connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Creates a disconnected client with its own empty registries.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_registries(config, Arc::new(SerialRegistry::new()), Arc::new(Commands::new()))
    }

    /// Creates a disconnected client sharing the given registries.
    pub fn with_registries(config: ClientConfig, serial: Arc<SerialRegistry>, commands: Arc<Commands>) -> Self {
        let connection = config.connection.clone();
        Self::build(
            ConnectionId::NIL,
            Some(config),
            connection,
            serial,
            commands,
            ConnectionHooks::default(),
            ConnectionState::Disconnected,
        )
    }

    fn build(
        id: ConnectionId,
        client: Option<ClientConfig>,
        config: ConnectionConfig,
        serial: Arc<SerialRegistry>,
        commands: Arc<Commands>,
        hooks: ConnectionHooks,
        state: ConnectionState,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                id: RwLock::new(id),
                client,
                config,
                state: watch::channel(state).0,
                serial,
                commands: RwLock::new(commands),
                link: Mutex::new(None),
                pending_read: Mutex::new(None),
                hooks: RwLock::new(hooks),
                epoch: now,
                last_received: Mutex::new(now),
                pings: Mutex::new(None),
                keepalives: Mutex::new(None),
                ping_observer: RwLock::new(None),
            }),
        }
    }

    /// Wraps a stream a server has just accepted.
    ///
    /// The connection is `Connected` immediately and the Identify frame is
    /// queued, but nothing is read until [`start`](Self::start) is called.
    /// That gap lets the owner register the connection before any of its
    /// frames (or its disconnect) can be observed.
    pub fn accept(
        stream: TcpStream,
        id: ConnectionId,
        udp: Arc<UdpSocket>,
        serial: Arc<SerialRegistry>,
        commands: Arc<Commands>,
        config: ConnectionConfig,
        hooks: ConnectionHooks,
    ) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let udp_port = udp.local_addr()?.port();
        let (read, write) = stream.into_split();

        let connection = Self::build(id, None, config, serial, commands, hooks, ConnectionState::Connected);

        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(io::write_stream(write, queue, id));
        let identify = ControlFrame::Identify {
            connection_id: id,
            udp_port,
        };
        // The queue was just created, so this cannot fail.
        let _ = outbound.send(identify.encode());

        *lock(&connection.inner.link) = Some(Link {
            outbound,
            udp,
            udp_peer: None,
            peer_addr,
            local_addr,
            tasks: Vec::new(),
        });
        *lock(&connection.inner.pending_read) = Some(read);

        debug!(conn = %id, %peer_addr, "accepted connection");
        Ok(connection)
    }

    /// Starts reading an accepted connection and its configured timers.
    ///
    /// Does nothing for client connections or if already started.
    pub fn start(&self) {
        let Some(read) = lock(&self.inner.pending_read).take() else {
            return;
        };
        let reader = tokio::spawn(io::read_stream(self.clone(), read, Vec::new()));
        self.attach_tasks(vec![reader]);
        self.start_configured_timers();
    }

    /// Records reader tasks on the live link, or aborts them if the
    /// connection closed while they were being spawned.
    pub(crate) fn attach_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        let mut link = lock(&self.inner.link);
        match link.as_mut() {
            Some(link) => link.tasks.extend(tasks),
            None => tasks.iter().for_each(JoinHandle::abort),
        }
    }

    pub(crate) fn start_configured_timers(&self) {
        if let Some(interval) = self.inner.config.ping_interval {
            self.start_pings(interval);
        }
        if let Some(interval) = self.inner.config.keepalive_interval {
            self.start_keepalives(interval);
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The id assigned by the server. [`ConnectionId::NIL`] on a client that
    /// has never connected.
    pub fn id(&self) -> ConnectionId {
        *self.inner.id.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether this handle was created by a client rather than accepted.
    pub fn is_client(&self) -> bool {
        self.inner.client.is_some()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The remote address of the stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.link).as_ref().map(|link| link.peer_addr)
    }

    /// The local address of the stream.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.link).as_ref().map(|link| link.local_addr)
    }

    /// Where unreliable frames are sent.
    pub fn udp_peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.link).as_ref().and_then(|link| link.udp_peer)
    }

    pub fn serializer(&self) -> &Arc<SerialRegistry> {
        &self.inner.serial
    }

    /// The registry incoming commands dispatch through.
    pub fn commands(&self) -> Arc<Commands> {
        Arc::clone(&self.inner.commands.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps the registry incoming commands dispatch through.
    ///
    /// Frames already being decoded finish against the old registry.
    pub fn set_command_registry(&self, commands: Arc<Commands>) {
        *self.inner.commands.write().unwrap_or_else(PoisonError::into_inner) = commands;
    }

    /// Replaces the owner hooks.
    pub fn set_hooks(&self, hooks: ConnectionHooks) {
        *self.inner.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    /// Installs the observer that receives round-trip samples.
    pub fn on_ping_received<F>(&self, observer: F)
    where
        F: Fn(&Connection, Duration) + Send + Sync + 'static,
    {
        *self
            .inner
            .ping_observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Time since anything was last received from the peer.
    pub fn since_last_received(&self) -> Duration {
        lock(&self.inner.last_received).elapsed()
    }

    /// Resolves once the connection is `Disconnected`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends a command with typed arguments.
    ///
    /// Fails with [`ConnectionError::NotConnected`] outside `Connected`, and
    /// with an unregistered-alias protocol error if `alias` is unknown.
    pub fn send_command<A: CommandArgs>(&self, channel: Channel, alias: &str, args: A) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let frame = self.commands().encode_command(alias, args, &self.inner.serial)?;
        self.send_frame(channel, frame)
    }

    /// Sends a command with raw values.
    pub fn send_values(&self, channel: Channel, alias: &str, values: &[Value]) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let frame = self.commands().encode_values(alias, values, &self.inner.serial)?;
        self.send_frame(channel, frame)
    }

    /// Sends an already encoded frame.
    ///
    /// Used to encode a broadcast once and deliver the same bytes to many
    /// connections.
    pub fn send_frame(&self, channel: Channel, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let link = lock(&self.inner.link);
        let link = link.as_ref().ok_or(ConnectionError::NotConnected)?;
        match channel {
            Channel::Reliable => link
                .outbound
                .send(frame)
                .map_err(|_| ConnectionError::NotConnected),
            Channel::Unreliable => {
                if frame.len() > MAX_DATAGRAM_SIZE {
                    return Err(ConnectionError::FrameTooLarge {
                        size: frame.len(),
                        max: MAX_DATAGRAM_SIZE,
                    });
                }
                let peer = link.udp_peer.ok_or(ConnectionError::NoDatagramRoute)?;
                link.udp.try_send_to(&frame, peer)?;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    pub(crate) fn touch(&self) {
        *lock(&self.inner.last_received) = Instant::now();
    }

    pub(crate) fn elapsed_nanos(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    /// Handles one datagram addressed to this connection.
    ///
    /// Anything that does not parse as exactly one frame is dropped.
    pub fn handle_datagram(&self, datagram: &[u8]) {
        if !self.is_connected() {
            return;
        }
        let commands = self.commands();
        match decode_datagram(datagram, &commands, &self.inner.serial) {
            Ok(frame) => {
                if let Err(e) = self.handle_frame(frame, Channel::Unreliable, &commands) {
                    debug!(conn = %self.id(), error = %e, "dropped datagram");
                }
            }
            Err(e) => {
                debug!(conn = %self.id(), error = %e, len = datagram.len(), "dropped undecodable datagram");
            }
        }
    }

    /// Acts on one decoded frame.
    ///
    /// An error means the frame was unusable. The stream reader treats that
    /// as fatal; the datagram path just drops it.
    pub(crate) fn handle_frame(&self, frame: Frame, channel: Channel, commands: &Commands) -> Result<(), ProtocolError> {
        self.touch();
        match frame {
            Frame::Command { id, args } => match commands.invoke(id, self, args) {
                Ok(()) => Ok(()),
                Err(ProtocolError::NoHandler(alias)) => {
                    warn!(conn = %self.id(), %alias, "received command with no handler");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Frame::Control(control) => {
                self.handle_control(control, channel);
                Ok(())
            }
        }
    }

    fn handle_control(&self, control: ControlFrame, channel: Channel) {
        match control {
            ControlFrame::Ping { sent_nanos } => {
                let echo = ControlFrame::PingEcho { sent_nanos }.encode();
                if let Err(e) = self.send_frame(channel, echo) {
                    debug!(conn = %self.id(), error = %e, "failed to echo ping");
                }
            }
            ControlFrame::PingEcho { sent_nanos } => {
                let rtt = Duration::from_nanos(self.elapsed_nanos().saturating_sub(sent_nanos));
                trace!(conn = %self.id(), rtt_us = rtt.as_micros() as u64, "ping echo");
                let observer = self
                    .inner
                    .ping_observer
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(observer) = observer {
                    observer(self, rtt);
                }
            }
            ControlFrame::KeepAlive => {
                trace!(conn = %self.id(), "keepalive");
            }
            ControlFrame::AnnounceUdp { port } => {
                if self.is_client() || channel != Channel::Reliable {
                    return;
                }
                self.bind_udp_peer(port);
            }
            ControlFrame::Identify { .. } => {
                debug!(conn = %self.id(), "ignoring Identify after handshake");
            }
            ControlFrame::Goodbye => {
                debug!(conn = %self.id(), "peer said goodbye");
                self.close(None);
            }
        }
    }

    fn bind_udp_peer(&self, port: u16) {
        let addr = {
            let mut link = lock(&self.inner.link);
            let Some(link) = link.as_mut() else {
                return;
            };
            let addr = SocketAddr::new(link.peer_addr.ip(), port);
            link.udp_peer = Some(addr);
            addr
        };
        debug!(conn = %self.id(), udp = %addr, "peer announced udp address");

        let hook = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_udp_address
            .clone();
        if let Some(hook) = hook {
            hook(self, addr);
        }
    }

    // -----------------------------------------------------------------------
    // Pings and keepalives
    // -----------------------------------------------------------------------

    /// Starts sending pings every `interval`. The first one is delayed by
    /// up to a tenth of `interval` so connections accepted together do not
    /// ping in lockstep.
    ///
    /// Returns `true` if pings were started, `false` if they were already
    /// running or the connection is not connected.
    pub fn start_pings(&self, interval: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut slot = lock(&self.inner.pings);
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        *slot = Some(RepeatingTimer::spawn_with_jitter("ping", interval, interval / 10, move || {
            let Some(connection) = upgrade(&weak) else {
                return TimerFlow::Stop;
            };
            let ping = ControlFrame::Ping {
                sent_nanos: connection.elapsed_nanos(),
            };
            match connection.send_frame(Channel::Reliable, ping.encode()) {
                Ok(()) => TimerFlow::Continue,
                Err(_) => TimerFlow::Stop,
            }
        }));
        debug!(conn = %self.id(), ?interval, "pings started");
        true
    }

    /// Stops sending pings. Returns `true` if they were running.
    pub fn stop_pings(&self) -> bool {
        let timer = lock(&self.inner.pings).take();
        let was_running = timer.as_ref().is_some_and(|timer| !timer.is_finished());
        drop(timer);
        if was_running {
            debug!(conn = %self.id(), "pings stopped");
        }
        was_running
    }

    pub fn is_sending_pings(&self) -> bool {
        lock(&self.inner.pings)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Starts sending keepalives every `interval` and enforcing the
    /// liveness deadline (`interval` times the configured multiplier).
    ///
    /// Returns `true` if keepalives were started, `false` if they were
    /// already running or the connection is not connected.
    pub fn start_keepalives(&self, interval: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut slot = lock(&self.inner.keepalives);
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return false;
        }

        let deadline = self.inner.config.keepalive_deadline(interval);
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(RepeatingTimer::spawn_with_jitter("keepalive", interval, interval / 10, move || {
            let Some(connection) = upgrade(&weak) else {
                return TimerFlow::Stop;
            };
            let silent = connection.since_last_received();
            if silent > deadline {
                warn!(conn = %connection.id(), ?silent, ?deadline, "peer timed out");
                connection.close(Some(ConnectionError::PeerTimeout(silent)));
                return TimerFlow::Stop;
            }
            match connection.send_frame(Channel::Reliable, ControlFrame::KeepAlive.encode()) {
                Ok(()) => TimerFlow::Continue,
                Err(_) => TimerFlow::Stop,
            }
        }));
        debug!(conn = %self.id(), ?interval, ?deadline, "keepalives started");
        true
    }

    /// Stops sending keepalives. Returns `true` if they were running.
    pub fn stop_keepalives(&self) -> bool {
        let timer = lock(&self.inner.keepalives).take();
        let was_running = timer.as_ref().is_some_and(|timer| !timer.is_finished());
        drop(timer);
        if was_running {
            debug!(conn = %self.id(), "keepalives stopped");
        }
        was_running
    }

    pub fn is_sending_keepalives(&self) -> bool {
        lock(&self.inner.keepalives)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Closes both transports, stops all timers, and tells the peer.
    ///
    /// Idempotent. The disconnect hook sees a clean close (`None`).
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.inner.link).as_ref() {
            if self.is_connected() {
                let _ = link.outbound.send(ControlFrame::Goodbye.encode());
            }
        }
        self.close(None);
    }

    /// The single close path. Only the first caller gets past the state
    /// transition.
    pub(crate) fn close(&self, reason: Option<ConnectionError>) {
        let closed_now = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if !closed_now {
            return;
        }

        let pings = lock(&self.inner.pings).take();
        let keepalives = lock(&self.inner.keepalives).take();
        drop((pings, keepalives));

        let link = lock(&self.inner.link).take();
        drop(lock(&self.inner.pending_read).take());
        if let Some(link) = link {
            for task in &link.tasks {
                task.abort();
            }
            // Dropping the queue sender lets the writer flush and shut down.
            drop(link);
        }

        let id = self.id();
        match &reason {
            None => info!(conn = %id, "connection closed"),
            Some(e) => info!(conn = %id, error = %e, "connection lost"),
        }

        let hook = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_disconnect
            .clone();
        if let Some(hook) = hook {
            hook(self, reason.as_ref());
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<Connection> {
    weak.upgrade().map(|inner| Connection { inner })
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("client", &self.is_client())
            .finish()
    }
}
