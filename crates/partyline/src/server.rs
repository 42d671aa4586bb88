//! The partyline server: TCP accept loop plus one shared UDP socket.
//!
//! ```text
//!            ┌──────── accept loop ────────┐
//! TCP ──────▶│ gate → Connection::accept   │──▶ connections: id → Connection
//!            │ on_client_connect → start() │
//!            └─────────────────────────────┘
//!            ┌──────── datagram loop ──────┐
//! UDP ──────▶│ sender addr → id → handle   │◀── addresses: addr → id
//!            └─────────────────────────────┘
//! ```
//!
//! Accepted connections write their datagrams through the same shared
//! socket. A datagram's sender address is the only thing that identifies
//! which connection it belongs to, so the address map is filled in when a
//! client announces its UDP port and emptied when the connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use partyline_protocol::{ConnectionId, SerialRegistry};
use partyline_transport::{Commands, Connection, ConnectionError, ConnectionHooks};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::PartylineError;

const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Called with each connection the server admits, before it starts reading.
pub type ClientConnectHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Called once with each connection that closes, and why.
pub type ClientDisconnectHook = Arc<dyn Fn(&Connection, Option<&ConnectionError>) + Send + Sync>;

/// Sockets and tasks that exist only while started.
struct Running {
    tcp_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerInner {
    config: ServerConfig,
    serial: Arc<SerialRegistry>,
    commands: Arc<Commands>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    /// UDP sender address → owning connection. Read on every datagram.
    addresses: RwLock<HashMap<SocketAddr, ConnectionId>>,
    accepting: AtomicBool,
    running: Mutex<Option<Running>>,
    on_connect: RwLock<Option<ClientConnectHook>>,
    on_disconnect: RwLock<Option<ClientDisconnectHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A handle to a partyline server. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a stopped server with empty registries.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_serializer(config, Arc::new(SerialRegistry::new()))
    }

    /// Creates a stopped server sharing a serialization registry.
    pub fn with_serializer(config: ServerConfig, serial: Arc<SerialRegistry>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                serial,
                commands: Arc::new(Commands::new()),
                connections: RwLock::new(HashMap::new()),
                addresses: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(false),
                running: Mutex::new(None),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The registry connections dispatch through until a session claims
    /// them.
    pub fn commands(&self) -> &Arc<Commands> {
        &self.inner.commands
    }

    pub fn serializer(&self) -> &Arc<SerialRegistry> {
        &self.inner.serial
    }

    /// Installs the hook run for every admitted connection.
    ///
    /// It runs before the connection reads its first frame, so it can
    /// point the connection at another command registry.
    pub fn on_client_connect<F>(&self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        *self.inner.on_connect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Installs the hook run once for every connection that closes.
    pub fn on_client_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Connection, Option<&ConnectionError>) + Send + Sync + 'static,
    {
        *self.inner.on_disconnect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Binds the TCP listener and the UDP socket and spawns both loops.
    ///
    /// Clients are not admitted until [`allow_clients`](Self::allow_clients).
    pub async fn start(&self) -> Result<(), PartylineError> {
        if lock(&self.inner.running).is_some() {
            return Err(PartylineError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let display = format!("{}:{}", config.address, config.port);
        let bind_error = |source| PartylineError::Bind {
            addr: display.clone(),
            source,
        };
        let addr = tokio::net::lookup_host((config.address.as_str(), config.port))
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| bind_error(std::io::ErrorKind::AddrNotAvailable.into()))?;

        let listener = listen(addr, config.backlog).map_err(bind_error)?;
        let tcp_addr = listener.local_addr().map_err(bind_error)?;
        let udp = UdpSocket::bind(addr).await.map_err(bind_error)?;
        let udp = Arc::new(udp);
        let udp_addr = udp.local_addr().map_err(bind_error)?;

        let mut running = lock(&self.inner.running);
        if running.is_some() {
            return Err(PartylineError::AlreadyStarted);
        }
        let weak = Arc::downgrade(&self.inner);
        let tasks = vec![
            tokio::spawn(accept_loop(weak.clone(), listener, Arc::clone(&udp))),
            tokio::spawn(datagram_loop(weak, Arc::clone(&udp))),
        ];
        *running = Some(Running { tcp_addr, udp, tasks });
        drop(running);

        info!(tcp = %tcp_addr, udp = %udp_addr, max_clients = config.max_clients, "server started");
        Ok(())
    }

    /// Starts admitting new connections.
    pub fn allow_clients(&self) {
        self.inner.accepting.store(true, Ordering::SeqCst);
        debug!("accepting clients");
    }

    /// Stops admitting new connections. Existing ones are unaffected.
    pub fn disallow_clients(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        debug!("no longer accepting clients");
    }

    pub fn is_accepting_clients(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Disconnects every connection. Each one fires the disconnect hook.
    pub fn disconnect_all_clients(&self) {
        for connection in self.connections() {
            connection.disconnect();
        }
    }

    /// Stops both loops, closes the sockets, and disconnects everyone.
    ///
    /// Idempotent. The server can be started again afterwards.
    pub async fn stop(&self) {
        self.disallow_clients();
        let running = lock(&self.inner.running).take();
        self.disconnect_all_clients();
        if let Some(running) = running {
            for task in &running.tasks {
                task.abort();
            }
            for task in running.tasks {
                let _ = task.await;
            }
            info!(tcp = %running.tcp_addr, "server stopped");
        }
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// The bound TCP address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.running).as_ref().map(|r| r.tcp_addr)
    }

    /// The bound UDP address, once started.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.running)
            .as_ref()
            .and_then(|r| r.udp.local_addr().ok())
    }

    /// A snapshot of every live connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.connections.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .field("accepting", &self.is_accepting_clients())
            .finish()
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, udp: &Arc<UdpSocket>) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(%peer, "rejected client: not accepting");
            return;
        }
        let count = self.connections.read().unwrap_or_else(PoisonError::into_inner).len();
        if count >= self.config.max_clients {
            warn!(%peer, max_clients = self.config.max_clients, "rejected client: server full");
            return;
        }

        let id = ConnectionId::random();
        let connection = match Connection::accept(
            stream,
            id,
            Arc::clone(udp),
            Arc::clone(&self.serial),
            Arc::clone(&self.commands),
            self.config.connection.clone(),
            self.hooks(),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%peer, error = %e, "failed to set up accepted stream");
                return;
            }
        };

        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, connection.clone());
        info!(conn = %id, %peer, clients = count + 1, "client connected");

        let hook = self.on_connect.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(&connection);
        }
        connection.start();
    }

    fn hooks(self: &Arc<Self>) -> ConnectionHooks {
        let on_udp = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);
        ConnectionHooks {
            on_udp_address: Some(Arc::new(move |connection: &Connection, addr: SocketAddr| {
                if let Some(server) = on_udp.upgrade() {
                    server.map_address(connection.id(), addr);
                }
            })),
            on_disconnect: Some(Arc::new(
                move |connection: &Connection, reason: Option<&ConnectionError>| {
                    if let Some(server) = on_close.upgrade() {
                        server.remove(connection, reason);
                    }
                },
            )),
        }
    }

    fn map_address(&self, id: ConnectionId, addr: SocketAddr) {
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        addresses.retain(|_, owner| *owner != id);
        if let Some(previous) = addresses.insert(addr, id) {
            warn!(conn = %id, %addr, previous = %previous, "udp address taken over");
        }
    }

    fn remove(&self, connection: &Connection, reason: Option<&ConnectionError>) {
        let id = connection.id();
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if !removed {
            return;
        }
        self.addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, owner| *owner != id);
        match reason {
            None => info!(conn = %id, "client disconnected"),
            Some(e) => info!(conn = %id, error = %e, "client lost"),
        }

        let hook = self.on_disconnect.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(connection, reason);
        }
    }

    fn route(&self, from: SocketAddr) -> Option<Connection> {
        let id = *self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&from)?;
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

async fn accept_loop(server: Weak<ServerInner>, listener: TcpListener, udp: Arc<UdpSocket>) {
    loop {
        let accepted = listener.accept().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        match accepted {
            Ok((stream, peer)) => server.admit(stream, peer, &udp),
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn datagram_loop(server: Weak<ServerInner>, udp: Arc<UdpSocket>) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    loop {
        let received = udp.recv_from(&mut buf).await;
        let Some(server) = server.upgrade() else {
            return;
        };
        match received {
            Ok((len, from)) => match server.route(from) {
                Some(connection) => connection.handle_datagram(&buf[..len]),
                None => trace!(%from, len, "dropped datagram from unknown sender"),
            },
            Err(e) => {
                debug!(error = %e, "datagram receive failed");
                tokio::task::yield_now().await;
            }
        }
    }
}
