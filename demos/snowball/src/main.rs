use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use partyline::prelude::*;
use partyline::protocol::{ByteReader, WriteExt};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WAITING: &str = "waiting";
const ARENA: &str = "snowball";
const MIN_PLAYERS: usize = 2;

const HIT_POINTS: i32 = 50;
const HIT_PENALTY: i32 = -25;
const SURVIVE_POINTS: i32 = 10;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    id: ConnectionId,
    name: String,
}

impl Message for PlayerInfo {
    const TYPE_NAME: &'static str = "PlayerInfo";

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u128(self.id.into_inner());
        out.put_str(&self.name);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: ConnectionId::new(reader.read_u128()?),
            name: reader.read_string()?,
        })
    }

    fn byte_len(&self) -> usize {
        16 + 4 + self.name.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    x: f32,
    y: f32,
}

impl Message for Position {
    const TYPE_NAME: &'static str = "Position";

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_f32(self.x);
        out.put_f32(self.y);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            x: reader.read_f32()?,
            y: reader.read_f32()?,
        })
    }

    fn byte_len(&self) -> usize {
        8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snowball {
    thrower: ConnectionId,
    origin: Position,
    angle: f32,
    power: f32,
}

impl Message for Snowball {
    const TYPE_NAME: &'static str = "Snowball";

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u128(self.thrower.into_inner());
        self.origin.encode(out);
        out.put_f32(self.angle);
        out.put_f32(self.power);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            thrower: ConnectionId::new(reader.read_u128()?),
            origin: Position::decode(reader)?,
            angle: reader.read_f32()?,
            power: reader.read_f32()?,
        })
    }

    fn byte_len(&self) -> usize {
        16 + 8 + 4 + 4
    }
}

// ---------------------------------------------------------------------------
// Game rules
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Player {
    name: String,
    dead: bool,
    points: i32,
}

/// Round state for the snowball session. Pure logic, no networking.
#[derive(Debug, Default)]
struct Arena {
    players: HashMap<ConnectionId, Player>,
    running: bool,
}

impl Arena {
    fn join(&mut self, id: ConnectionId, name: String) {
        self.players.insert(
            id,
            Player {
                name,
                dead: false,
                points: 0,
            },
        );
    }

    fn leave(&mut self, id: ConnectionId) {
        self.players.remove(&id);
    }

    fn start(&mut self) {
        self.running = true;
        for player in self.players.values_mut() {
            player.dead = false;
        }
    }

    fn info(&self, id: ConnectionId) -> Option<PlayerInfo> {
        self.players.get(&id).map(|p| PlayerInfo {
            id,
            name: p.name.clone(),
        })
    }

    /// Scores a hit. Returns the winner if this hit ended the round.
    fn hit(&mut self, thrower: ConnectionId, victim: ConnectionId) -> Option<ConnectionId> {
        if !self.running || thrower == victim {
            return None;
        }
        let victim = self.players.get_mut(&victim).filter(|p| !p.dead)?;
        victim.dead = true;
        victim.points += HIT_PENALTY;
        if let Some(thrower) = self.players.get_mut(&thrower) {
            thrower.points += HIT_POINTS;
        }
        self.winner()
    }

    /// Ends the round once one player is left standing.
    fn winner(&mut self) -> Option<ConnectionId> {
        if !self.running {
            return None;
        }
        let mut alive = self.players.iter().filter(|(_, p)| !p.dead);
        let (id, _) = alive.next()?;
        if alive.next().is_some() {
            return None;
        }
        self.running = false;
        Some(*id)
    }

    /// Gives every living player survival points; returns the new totals.
    fn award_survivors(&mut self) -> Vec<(ConnectionId, i32)> {
        if !self.running {
            return Vec::new();
        }
        self.players
            .iter_mut()
            .filter(|(_, p)| !p.dead)
            .map(|(id, p)| {
                p.points += SURVIVE_POINTS;
                (*id, p.points)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

enum LobbyEvent {
    Ready,
    Finished(PlayerInfo),
}

struct Game {
    names: Mutex<HashMap<ConnectionId, String>>,
    ready: Mutex<HashSet<ConnectionId>>,
    arena: Mutex<Arena>,
    events: mpsc::UnboundedSender<LobbyEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn build(server: &Server) -> Result<(Lobby, Arc<Game>, mpsc::UnboundedReceiver<LobbyEvent>), PartylineError> {
    let serial = server.serializer();
    serial.register_message::<PlayerInfo>()?;
    serial.register_message::<Position>()?;
    serial.register_message::<Snowball>()?;

    let (events, rx) = mpsc::unbounded_channel();
    let game = Arc::new(Game {
        names: Mutex::new(HashMap::new()),
        ready: Mutex::new(HashSet::new()),
        arena: Mutex::new(Arena::default()),
        events,
    });

    let waiting = Session::new(WAITING, Arc::clone(serial));
    let g = Arc::clone(&game);
    waiting
        .commands()
        .register_command("ready", move |conn: &Connection, (name,): (String,)| {
            info!(conn = %conn.id(), %name, "player ready");
            lock(&g.names).insert(conn.id(), name);
            lock(&g.ready).insert(conn.id());
            let _ = g.events.send(LobbyEvent::Ready);
        })?;
    let g = Arc::clone(&game);
    waiting.on_leave(move |_, conn| {
        lock(&g.ready).remove(&conn.id());
    });

    let arena = Session::new(ARENA, Arc::clone(serial));
    register_arena(&arena, &game)?;

    let lobby = Lobby::new(server.clone(), waiting);
    lobby.add_session(arena)?;
    Ok((lobby, game, rx))
}

fn register_arena(arena: &Arc<Session>, game: &Arc<Game>) -> Result<(), PartylineError> {
    let commands = arena.commands();
    commands.register_alias::<()>("round-started")?;
    commands.register_alias::<(i32,)>("points")?;
    commands.register_alias::<(PlayerInfo, Position)>("player-moved")?;
    commands.register_alias::<(Snowball,)>("snowball-thrown")?;
    commands.register_alias::<(PlayerInfo,)>("game-finished")?;

    let g = Arc::clone(game);
    arena.on_join(move |_, conn| {
        let name = lock(&g.names)
            .get(&conn.id())
            .cloned()
            .unwrap_or_else(|| "snowman".to_string());
        lock(&g.arena).join(conn.id(), name);
    });
    let g = Arc::clone(game);
    arena.on_leave(move |_, conn| {
        let mut state = lock(&g.arena);
        state.leave(conn.id());
        if let Some(winner) = state.winner().and_then(|id| state.info(id)) {
            let _ = g.events.send(LobbyEvent::Finished(winner));
        }
    });

    let (g, session) = (Arc::clone(game), Arc::downgrade(arena));
    commands.register_command("move", move |conn: &Connection, (position,): (Position,)| {
        let info = lock(&g.arena).info(conn.id());
        if let (Some(info), Some(session)) = (info, session.upgrade()) {
            let _ = session.send_command(
                Recipient::AllExcept(conn.id()),
                Channel::Unreliable,
                "player-moved",
                (info, position),
            );
        }
    })?;

    let session = Arc::downgrade(arena);
    commands.register_command("throw", move |conn: &Connection, (snowball,): (Snowball,)| {
        if let Some(session) = session.upgrade() {
            let _ = session.send_command(
                Recipient::AllExcept(conn.id()),
                Channel::Reliable,
                "snowball-thrown",
                (snowball,),
            );
        }
    })?;

    let (g, session) = (Arc::clone(game), Arc::downgrade(arena));
    commands.register_command("hit", move |conn: &Connection, (snowball,): (Snowball,)| {
        let winner = {
            let mut state = lock(&g.arena);
            state.hit(snowball.thrower, conn.id()).and_then(|id| state.info(id))
        };
        let (Some(winner), Some(session)) = (winner, session.upgrade()) else {
            return;
        };
        info!(winner = %winner.name, "round over");
        let _ = session.send_command(Recipient::All, Channel::Reliable, "game-finished", (winner.clone(),));
        let _ = g.events.send(LobbyEvent::Finished(winner));
    })?;

    Ok(())
}

fn start_round(lobby: &Lobby, game: &Arc<Game>) -> Result<(), PartylineError> {
    let arena = lobby
        .session(ARENA)
        .ok_or_else(|| PartylineError::UnknownSession(ARENA.to_string()))?;
    let moved = lobby.move_all(WAITING, ARENA)?;
    lock(&game.ready).clear();
    lock(&game.arena).start();
    arena.send_command(Recipient::All, Channel::Reliable, "round-started", ())?;

    let g = Arc::clone(game);
    arena.start_timer("survivor-points", Duration::from_secs(1), move |session| {
        let totals = lock(&g.arena).award_survivors();
        for (id, points) in totals {
            let _ = session.send_command(Recipient::Connection(id), Channel::Reliable, "points", (points,));
        }
        TimerFlow::Continue
    });
    info!(players = moved, "round started");
    Ok(())
}

fn end_round(lobby: &Lobby, winner: &PlayerInfo) -> Result<(), PartylineError> {
    if let Some(arena) = lobby.session(ARENA) {
        arena.stop_timer("survivor-points");
    }
    let moved = lobby.move_all(ARENA, WAITING)?;
    info!(winner = %winner.name, players = moved, "back to the waiting room");
    Ok(())
}

/// Reacts to game events that need the lobby.
async fn coordinate(lobby: Lobby, game: Arc<Game>, mut events: mpsc::UnboundedReceiver<LobbyEvent>) {
    while let Some(event) = events.recv().await {
        let result = match event {
            LobbyEvent::Ready => {
                let Some(waiting) = lobby.session(WAITING) else {
                    continue;
                };
                let members = waiting.member_ids();
                let all_ready = {
                    let ready = lock(&game.ready);
                    members.len() >= MIN_PLAYERS && members.iter().all(|id| ready.contains(id))
                };
                if all_ready {
                    start_round(&lobby, &game)
                } else {
                    Ok(())
                }
            }
            LobbyEvent::Finished(winner) => end_round(&lobby, &winner),
        };
        if let Err(e) = result {
            warn!(error = %e, "lobby transition failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config: ServerConfig = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::new("0.0.0.0", 19999),
    };

    let server = Server::new(config);
    let (lobby, game, events) = build(&server)?;
    server.start().await?;
    server.allow_clients();
    tokio::spawn(coordinate(lobby.clone(), game, events));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    lobby.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: u128) -> Arena {
        let mut arena = Arena::default();
        for i in 1..=n {
            arena.join(ConnectionId::new(i), format!("p{i}"));
        }
        arena.start();
        arena
    }

    // =========================================================================
    // Rules
    // =========================================================================

    #[test]
    fn test_hit_scores_both_players() {
        let mut arena = arena_with(3);
        let (a, b) = (ConnectionId::new(1), ConnectionId::new(2));
        assert_eq!(arena.hit(a, b), None);
        assert_eq!(arena.players[&a].points, HIT_POINTS);
        assert_eq!(arena.players[&b].points, HIT_PENALTY);
        assert!(arena.players[&b].dead);
    }

    #[test]
    fn test_last_player_standing_wins_once() {
        let mut arena = arena_with(2);
        let (a, b) = (ConnectionId::new(1), ConnectionId::new(2));
        assert_eq!(arena.hit(a, b), Some(a));
        assert!(!arena.running);
        assert_eq!(arena.winner(), None);
    }

    #[test]
    fn test_hits_ignored_outside_round_or_on_self() {
        let mut arena = arena_with(2);
        let a = ConnectionId::new(1);
        assert_eq!(arena.hit(a, a), None);
        arena.running = false;
        assert_eq!(arena.hit(a, ConnectionId::new(2)), None);
        assert!(arena.players.values().all(|p| p.points == 0));
    }

    #[test]
    fn test_dead_players_do_not_earn_survival_points() {
        let mut arena = arena_with(3);
        arena.hit(ConnectionId::new(1), ConnectionId::new(3));
        let mut totals = arena.award_survivors();
        totals.sort();
        assert_eq!(
            totals,
            vec![
                (ConnectionId::new(1), HIT_POINTS + SURVIVE_POINTS),
                (ConnectionId::new(2), SURVIVE_POINTS)
            ]
        );
    }

    #[test]
    fn test_leaving_can_decide_the_round() {
        let mut arena = arena_with(2);
        arena.leave(ConnectionId::new(2));
        assert_eq!(arena.winner(), Some(ConnectionId::new(1)));
    }

    // =========================================================================
    // Wiring
    // =========================================================================

    #[tokio::test]
    async fn test_build_registers_both_sessions() {
        let server = Server::new(ServerConfig::new("127.0.0.1", 0));
        let (lobby, _game, _events) = build(&server).unwrap();
        assert_eq!(lobby.session_names(), [ARENA, WAITING]);
        assert_eq!(lobby.current_session().name(), WAITING);
        assert!(lobby.session(ARENA).unwrap().commands().contains("hit"));
    }
}
