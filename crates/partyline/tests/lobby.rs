//! Integration tests for the lobby: placement, switching, moving, relaying.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use partyline::prelude::*;
use partyline::transport::Commands;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

// =========================================================================
// Fixtures
// =========================================================================

struct Counters {
    joins: Arc<AtomicUsize>,
    leaves: Arc<AtomicUsize>,
}

fn counted(session: &Session) -> Counters {
    let joins = Arc::new(AtomicUsize::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));
    let j = Arc::clone(&joins);
    let l = Arc::clone(&leaves);
    session.on_join(move |_, _| {
        j.fetch_add(1, Ordering::SeqCst);
    });
    session.on_leave(move |_, _| {
        l.fetch_add(1, Ordering::SeqCst);
    });
    Counters { joins, leaves }
}

async fn lobby() -> Lobby {
    lobby_with(ConnectionConfig {
        keepalive_interval: None,
        ..ConnectionConfig::default()
    })
    .await
}

async fn lobby_with(connection: ConnectionConfig) -> Lobby {
    let server = Server::new(ServerConfig {
        connection,
        ..ServerConfig::new("127.0.0.1", 0)
    });
    let waiting = Session::new("waiting", Arc::clone(server.serializer()));
    let lobby = Lobby::new(server.clone(), waiting);
    lobby
        .add_session(Session::new("snowball", Arc::clone(server.serializer())))
        .unwrap();
    server.start().await.unwrap();
    server.allow_clients();
    lobby
}

async fn connect(lobby: &Lobby, commands: Arc<Commands>) -> Connection {
    let config = ClientConfig {
        connection: ConnectionConfig {
            keepalive_interval: None,
            ..ConnectionConfig::default()
        },
        ..ClientConfig::new("127.0.0.1", lobby.server().local_addr().unwrap().port())
    };
    let client = Connection::with_registries(config, Arc::new(SerialRegistry::new()), commands);
    client.connect().await.unwrap();
    let id = client.id();
    eventually(|| lobby.session_of(id).is_some()).await;
    client
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =========================================================================
// Placement
// =========================================================================

#[tokio::test]
async fn test_new_client_joins_current_session_and_leaves_on_disconnect() {
    let lobby = lobby().await;
    let waiting = lobby.session("waiting").unwrap();
    let counters = counted(&waiting);

    let client = connect(&lobby, Arc::new(Commands::new())).await;
    assert_eq!(lobby.session_of(client.id()).unwrap().name(), "waiting");
    assert_eq!(waiting.member_ids(), vec![client.id()]);
    assert_eq!(counters.joins.load(Ordering::SeqCst), 1);

    client.disconnect();
    eventually(|| waiting.is_empty()).await;
    assert!(lobby.session_of(client.id()).is_none());
    assert_eq!(counters.leaves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_registry_handles_member_commands() {
    let lobby = lobby().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    lobby
        .current_session()
        .commands()
        .register_command("ready", move |conn: &Connection, (name,): (String,)| {
            let _ = tx.send((conn.id(), name));
        })
        .unwrap();

    let commands = Arc::new(Commands::new());
    commands.register_alias::<(String,)>("ready").unwrap();
    let client = connect(&lobby, commands).await;
    client
        .send_command(Channel::Reliable, "ready", ("lucas".to_string(),))
        .unwrap();

    let (from, name) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, client.id());
    assert_eq!(name, "lucas");
}

#[tokio::test]
async fn test_switch_current_session_routes_new_clients() {
    let lobby = lobby().await;
    let first = connect(&lobby, Arc::new(Commands::new())).await;

    lobby.switch_current_session("snowball").unwrap();
    let second = connect(&lobby, Arc::new(Commands::new())).await;

    assert_eq!(lobby.session_of(first.id()).unwrap().name(), "waiting");
    assert_eq!(lobby.session_of(second.id()).unwrap().name(), "snowball");
}

#[tokio::test]
async fn test_keepalive_timeout_leaves_session_once() {
    let lobby = lobby_with(ConnectionConfig {
        keepalive_interval: Some(Duration::from_millis(50)),
        keepalive_timeout_multiplier: 2,
        ..ConnectionConfig::default()
    })
    .await;
    let waiting = lobby.session("waiting").unwrap();
    let counters = counted(&waiting);

    // Reads the Identify frame, then goes silent.
    let mut raw = TcpStream::connect(lobby.server().local_addr().unwrap())
        .await
        .unwrap();
    let mut identify = [0u8; 34];
    raw.read_exact(&mut identify).await.unwrap();
    eventually(|| waiting.len() == 1).await;
    let id = waiting.member_ids()[0];

    eventually(|| waiting.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(lobby.session_of(id).is_none());
    assert_eq!(counters.joins.load(Ordering::SeqCst), 1);
    assert_eq!(counters.leaves.load(Ordering::SeqCst), 1);
}

// =========================================================================
// Moving
// =========================================================================

#[tokio::test]
async fn test_move_client_switches_membership_and_dispatch() {
    let lobby = lobby().await;
    let waiting = lobby.session("waiting").unwrap();
    let snowball = lobby.session("snowball").unwrap();
    let waiting_counters = counted(&waiting);
    let snowball_counters = counted(&snowball);

    let (tx, mut rx) = mpsc::unbounded_channel();
    snowball
        .commands()
        .register_command("throw", move |conn: &Connection, (power,): (f32,)| {
            let _ = tx.send((conn.id(), power));
        })
        .unwrap();

    let commands = Arc::new(Commands::new());
    commands.register_alias::<(f32,)>("throw").unwrap();
    let mover = connect(&lobby, commands).await;
    let stayer = connect(&lobby, Arc::new(Commands::new())).await;

    lobby.move_client(mover.id(), "snowball").unwrap();
    assert_eq!(waiting.member_ids(), vec![stayer.id()]);
    assert_eq!(snowball.member_ids(), vec![mover.id()]);
    assert_eq!(lobby.session_of(mover.id()).unwrap().name(), "snowball");
    assert_eq!(waiting_counters.leaves.load(Ordering::SeqCst), 1);
    assert_eq!(snowball_counters.joins.load(Ordering::SeqCst), 1);

    // Moving into the same session again changes nothing.
    lobby.move_client(mover.id(), "snowball").unwrap();
    assert_eq!(snowball_counters.joins.load(Ordering::SeqCst), 1);

    mover.send_command(Channel::Reliable, "throw", (0.75f32,)).unwrap();
    let (from, power) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, mover.id());
    assert_eq!(power, 0.75);
}

#[tokio::test]
async fn test_refused_move_returns_client_to_source() {
    let lobby = lobby().await;
    let waiting = lobby.session("waiting").unwrap();
    let snowball = lobby.session("snowball").unwrap();
    let client = connect(&lobby, Arc::new(Commands::new())).await;
    let id = client.id();

    // Already a member of the target, so the target refuses the join.
    let server_side = lobby.server().connection(id).unwrap();
    snowball.receive_new_client(&server_side).unwrap();

    assert!(matches!(
        lobby.move_client(id, "snowball"),
        Err(PartylineError::Session(SessionError::AlreadyMember(refused))) if refused == id
    ));
    assert!(waiting.contains(id));
    assert_eq!(lobby.session_of(id).unwrap().name(), "waiting");
}

#[tokio::test]
async fn test_move_all_then_disconnect_leaves_target_session() {
    let lobby = lobby().await;
    let a = connect(&lobby, Arc::new(Commands::new())).await;
    let b = connect(&lobby, Arc::new(Commands::new())).await;

    assert_eq!(lobby.move_all("waiting", "snowball").unwrap(), 2);
    let snowball = lobby.session("snowball").unwrap();
    assert_eq!(snowball.len(), 2);
    assert!(lobby.session("waiting").unwrap().is_empty());

    a.disconnect();
    eventually(|| snowball.len() == 1).await;
    assert!(snowball.contains(b.id()));
}

// =========================================================================
// Relaying
// =========================================================================

#[tokio::test]
async fn test_position_update_relayed_to_everyone_but_sender() {
    let lobby = lobby().await;
    let session = lobby.current_session();
    session.commands().register_alias::<(f32, f32)>("moved").unwrap();
    let weak = Arc::downgrade(&session);
    session
        .commands()
        .register_command("move", move |conn: &Connection, (x, y): (f32, f32)| {
            if let Some(session) = weak.upgrade() {
                session
                    .send_command(Recipient::AllExcept(conn.id()), Channel::Reliable, "moved", (x, y))
                    .unwrap();
            }
        })
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let commands = Arc::new(Commands::new());
        commands.register_alias::<(f32, f32)>("move").unwrap();
        let seen = tx.clone();
        commands
            .register_command("moved", move |conn: &Connection, (x, y): (f32, f32)| {
                let _ = seen.send((conn.id(), x, y));
            })
            .unwrap();
        clients.push(connect(&lobby, commands).await);
    }

    let sender = &clients[0];
    sender.send_command(Channel::Reliable, "move", (10.0f32, 20.0f32)).unwrap();

    let mut receivers = Vec::new();
    for _ in 0..2 {
        let (id, x, y) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((x, y), (10.0, 20.0));
        receivers.push(id);
    }
    assert!(!receivers.contains(&sender.id()));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}
