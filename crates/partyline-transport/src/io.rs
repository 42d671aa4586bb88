//! Socket loops: stream reader, stream writer, client datagram reader.

use std::net::SocketAddr;
use std::sync::Arc;

use partyline_protocol::{decode_frame, Channel, ConnectionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::ConnectionError;

const READ_CHUNK: usize = 8 * 1024;
const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Drains the outbound queue onto the stream.
///
/// Ends when every sender is gone (the connection closed) or a write fails.
/// A failed write is not reported here: the reader sees the broken stream
/// and closes the connection with the real cause.
pub(crate) async fn write_stream(mut writer: OwnedWriteHalf, mut queue: mpsc::UnboundedReceiver<Vec<u8>>, id: ConnectionId) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(conn = %id, error = %e, "stream write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
    trace!(conn = %id, "writer finished");
}

/// Reads frames off the stream until it ends or breaks.
///
/// `buf` holds bytes already read past the handshake. Frames are decoded
/// one at a time; a partial frame stays buffered until more bytes arrive.
pub(crate) async fn read_stream(connection: Connection, mut reader: OwnedReadHalf, mut buf: Vec<u8>) {
    let max_frame = connection.config().max_frame_size;
    let mut chunk = vec![0u8; READ_CHUNK];

    // Buffer length the partial frame needs before decoding is retried.
    let mut wanted = 0;

    let reason = loop {
        if buf.len() >= wanted {
            match drain_frames(&connection, &mut buf) {
                Ok(next) => wanted = next,
                Err(e) => break Some(e),
            }
        }
        if !connection.is_connected() {
            return;
        }
        let size = buf.len().max(wanted);
        if size > max_frame {
            break Some(ConnectionError::FrameTooLarge { size, max: max_frame });
        }

        match reader.read(&mut chunk).await {
            Ok(0) if buf.is_empty() => break None,
            Ok(0) => {
                // The stream ended mid-frame. Decoding the leftover again
                // yields the precise truncation error.
                let commands = connection.commands();
                let e = match decode_frame(&buf, &commands, connection.serializer()) {
                    Err(e) => e.into(),
                    Ok(_) => ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()),
                };
                break Some(e);
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => break Some(e.into()),
        }
    };

    connection.close(reason);
}

/// Decodes and handles every complete frame at the front of `buf`.
///
/// Returns the buffer length the remaining partial frame needs at least,
/// so the caller does not decode it again after every small read.
fn drain_frames(connection: &Connection, buf: &mut Vec<u8>) -> Result<usize, ConnectionError> {
    while !buf.is_empty() && connection.is_connected() {
        let commands = connection.commands();
        let (frame, consumed) = match decode_frame(buf, &commands, connection.serializer()) {
            Ok(decoded) => decoded,
            Err(e) => match e.shortfall() {
                Some(missing) => return Ok(buf.len() + missing),
                None => return Err(e.into()),
            },
        };
        buf.drain(..consumed);
        connection.handle_frame(frame, Channel::Reliable, &commands)?;
    }
    Ok(0)
}

/// Receives datagrams on a client's own socket.
///
/// Only datagrams from the server's UDP address are considered.
pub(crate) async fn read_datagrams(connection: Connection, socket: Arc<UdpSocket>, server: SocketAddr) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) if from == server => connection.handle_datagram(&buf[..len]),
            Ok((len, from)) => {
                trace!(conn = %connection.id(), %from, len, "dropped datagram from unknown sender");
            }
            Err(e) => {
                // ICMP errors from earlier sends surface here on some
                // platforms; the socket itself is still usable.
                debug!(conn = %connection.id(), error = %e, "datagram receive failed");
                tokio::task::yield_now().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use partyline_protocol::SerialRegistry;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::{Commands, ConnectionHooks};

    async fn accepted(commands: Arc<Commands>) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let connection = Connection::accept(
            stream,
            ConnectionId::new(7),
            udp,
            Arc::new(SerialRegistry::new()),
            commands,
            ConnectionConfig {
                keepalive_interval: None,
                ..ConnectionConfig::default()
            },
            ConnectionHooks::default(),
        )
        .unwrap();
        (connection, peer)
    }

    #[tokio::test]
    async fn test_partial_frame_reports_full_length_needed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let commands = Arc::new(Commands::new());
        commands
            .register_command("blob", move |_: &Connection, (_text,): (String,)| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let (connection, _peer) = accepted(Arc::clone(&commands)).await;

        let frame = commands
            .encode_command("blob", ("x".repeat(10_000),), &SerialRegistry::new())
            .unwrap();
        let mut buf = frame[..100].to_vec();
        assert_eq!(drain_frames(&connection, &mut buf).unwrap(), frame.len());
        assert_eq!(buf.len(), 100);

        buf.extend_from_slice(&frame[100..]);
        assert_eq!(drain_frames(&connection, &mut buf).unwrap(), 0);
        assert!(buf.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
