//! Client-side connect and handshake.
//!
//! ```text
//! client                                   server
//!   | ---- TCP connect ---------------------> |
//!   | <--- Identify { id, udp port } -------- |
//!   |      bind UDP on the stream's local IP   |
//!   | ---- AnnounceUdp { port } -------------> |  server maps (peer ip, port) → id
//!   | <=== commands, pings, keepalives ======> |
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};

use partyline_protocol::{decode_frame, ConnectionId, ControlFrame, Frame};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::config::{ClientConfig, ConnectionState};
use crate::connection::{lock, Connection, Link};
use crate::error::ConnectionError;
use crate::io;

/// Everything the handshake produced, before the connection goes live.
struct Established {
    id: ConnectionId,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    leftover: Vec<u8>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    server_udp: SocketAddr,
}

impl Connection {
    /// Connects to the configured server.
    ///
    /// On success the connection is `Connected`, knows its [`id`](Self::id),
    /// and can send on both channels. On failure it is back in
    /// `Disconnected` and `connect` may be called again.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let Some(config) = self.inner.client.clone() else {
            return Err(ConnectionError::Handshake(
                "accepted connections cannot reconnect".to_owned(),
            ));
        };

        let began = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(ConnectionError::AlreadyConnected);
        }

        debug!(address = %config.address, port = config.port, "connecting");
        let result = match time::timeout(config.connect_timeout, self.establish(&config)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(config.connect_timeout)),
        };

        match result {
            Ok(established) => self.go_live(established),
            Err(e) => {
                self.inner.state.send_if_modified(|state| {
                    let changed = *state == ConnectionState::Connecting;
                    *state = ConnectionState::Disconnected;
                    changed
                });
                debug!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    async fn establish(&self, config: &ClientConfig) -> Result<Established, ConnectionError> {
        let stream = TcpStream::connect((config.address.as_str(), config.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ConnectionError::ConnectionRefused(e),
                _ => ConnectionError::Io(e),
            })?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (mut read, write) = stream.into_split();

        let commands = self.commands();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let (id, udp_port, consumed) = loop {
            if !buf.is_empty() {
                match decode_frame(&buf, &commands, self.serializer()) {
                    Ok((
                        Frame::Control(ControlFrame::Identify {
                            connection_id,
                            udp_port,
                        }),
                        consumed,
                    )) => break (connection_id, udp_port, consumed),
                    Ok((other, _)) => {
                        return Err(ConnectionError::Handshake(format!(
                            "expected Identify, got {other:?}"
                        )));
                    }
                    Err(e) if e.is_truncated() => {}
                    Err(e) => return Err(ConnectionError::Handshake(e.to_string())),
                }
            }
            let n = read.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectionError::Handshake(
                    "server closed the stream before identifying".to_owned(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        buf.drain(..consumed);

        let udp = UdpSocket::bind(SocketAddr::new(local_addr.ip(), 0)).await?;

        Ok(Established {
            id,
            read,
            write,
            leftover: buf,
            peer_addr,
            local_addr,
            udp: Arc::new(udp),
            server_udp: SocketAddr::new(peer_addr.ip(), udp_port),
        })
    }

    fn go_live(&self, established: Established) -> Result<(), ConnectionError> {
        let Established {
            id,
            read,
            write,
            leftover,
            peer_addr,
            local_addr,
            udp,
            server_udp,
        } = established;
        let udp_port = udp.local_addr()?.port();

        *self.inner.id.write().unwrap_or_else(PoisonError::into_inner) = id;
        self.touch();

        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(io::write_stream(write, queue, id));
        let _ = outbound.send(ControlFrame::AnnounceUdp { port: udp_port }.encode());

        *lock(&self.inner.link) = Some(Link {
            outbound,
            udp: Arc::clone(&udp),
            udp_peer: Some(server_udp),
            peer_addr,
            local_addr,
            tasks: Vec::new(),
        });

        let live = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !live {
            // disconnect() ran while the handshake was in flight.
            drop(lock(&self.inner.link).take());
            return Err(ConnectionError::NotConnected);
        }

        let reader = tokio::spawn(io::read_stream(self.clone(), read, leftover));
        let datagrams = tokio::spawn(io::read_datagrams(self.clone(), udp, server_udp));
        self.attach_tasks(vec![reader, datagrams]);
        self.start_configured_timers();

        info!(conn = %id, server = %peer_addr, udp = %server_udp, "connected");
        Ok(())
    }
}
