//! Session Coordinator
//!
//! Per-session server authority. Owns the canonical turn timeline for one
//! set of connected clients: assigns identifiers, runs the ready
//! handshake, finalizes and broadcasts turns on the lockstep cadence,
//! acknowledges and deduplicates commands, replays missed turns to
//! reconnecting clients and collects end-of-session results.
//!
//! The coordinator is single-threaded: all state is mutated from
//! [`SessionCoordinator::tick`], which drains the transport event stream
//! and advances the authority loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::{ClientSetup, ClientStart, CodecError, CommandRecord, Message, PlayerNum};
use crate::lockstep::{LockstepConfig, ServerLockstep, ServerTurn};
use crate::queue::{QueueConfig, ReceiveLog};
use crate::transport::{
    ChannelKind, ClientId, EventReceiver, ServerTransport, TransportError, TransportEvent,
};

/// Unique session identifier.
pub type SessionId = [u8; 16];

/// Result payload broadcast when the ready handshake times out.
pub const HANDSHAKE_TIMEOUT_RESULT: &[u8] = b"handshake-timeout";

/// Result payload sent to a client whose reconnect gap exceeds the
/// retained turn history; a full state resync is required.
pub const RESYNC_REQUIRED_RESULT: &[u8] = b"resync-required";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Collecting clients and readiness signals.
    Lobby,
    /// Lockstep in progress.
    Running,
    /// Results collected, end notifications sent.
    Ended,
    /// Handshake failed; session terminated for all participants.
    Aborted,
    /// Terminal, eligible for cleanup.
    Closed,
}

/// Configuration for a session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Players required before the ready handshake fires.
    pub expected_players: usize,
    /// Milliseconds allowed between session creation and all players
    /// ready before the session aborts.
    pub ready_timeout_ms: i64,
    /// Countdown broadcast in the ready handshake.
    pub start_delay_ms: i32,
    /// Milliseconds allowed between the first and last finish
    /// submission before the session ends anyway.
    pub finish_timeout_ms: i64,
    /// Finalized turns retained for reconnection replay.
    pub turn_history_limit: usize,
    /// Shared lockstep cadence.
    pub lockstep: LockstepConfig,
    /// Command queue tuning (receive window size is used server-side).
    pub queue: QueueConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expected_players: 2,
            ready_timeout_ms: 30_000,
            start_delay_ms: 3_000,
            finish_timeout_ms: 10_000,
            turn_history_limit: 128,
            lockstep: LockstepConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Not every expected player signalled ready in time.
    #[error("ready handshake timed out")]
    HandshakeTimeout,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A client connected to the session.
#[derive(Debug)]
struct ClientSlot {
    client: ClientId,
    player: PlayerNum,
    ready: bool,
    connected: bool,
    connections: u32,
    finished: Option<Vec<u8>>,
    malformed: u32,
}

/// The server authority for one session.
pub struct SessionCoordinator<T: ServerTransport> {
    id: SessionId,
    config: SessionConfig,
    transport: T,
    events: EventReceiver,
    clock: Arc<dyn Clock>,
    state: SessionState,
    slots: BTreeMap<ClientId, ClientSlot>,
    lockstep: ServerLockstep,
    recv_log: ReceiveLog,
    created_ms: i64,
    last_tick_ms: Option<i64>,
    handshake_sent: bool,
    first_finish_ms: Option<i64>,
}

impl<T: ServerTransport> SessionCoordinator<T> {
    /// Create a session in the lobby state.
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        transport: T,
        events: EventReceiver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let lockstep = ServerLockstep::new(config.lockstep, config.turn_history_limit);
        let recv_log = ReceiveLog::new(config.queue.receive_window);
        let created_ms = clock.now_ms();
        Self {
            id,
            config,
            transport,
            events,
            clock,
            state: SessionState::Lobby,
            slots: BTreeMap::new(),
            lockstep,
            recv_log,
            created_ms,
            last_tick_ms: None,
            handshake_sent: false,
            first_finish_ms: None,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of the turn currently open for submission.
    pub fn current_turn(&self) -> u32 {
        self.lockstep.current_turn()
    }

    /// Connected client count.
    pub fn client_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.connected).count()
    }

    /// True once every expected player has signalled ready.
    pub fn all_players_ready(&self) -> bool {
        self.slots.len() >= self.config.expected_players
            && self
                .slots
                .values()
                .all(|slot| slot.ready && slot.connected)
    }

    /// Mark the session closed; the manager removes closed sessions.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.lockstep.stop();
    }

    /// Advance the session: drain transport events, check timeouts and
    /// broadcast turns finalized on the lockstep cadence.
    pub fn tick(&mut self) -> Result<(), SessionError> {
        let now = self.clock.now_ms();

        // Hand transport events into this single execution context.
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        for event in events {
            self.handle_event(event, now);
        }

        // A handshake fired above re-bases the loop clock so the lobby
        // portion of this tick is not fed into the authority lockstep.
        let dt = self
            .last_tick_ms
            .map(|last| (now - last).max(0))
            .unwrap_or(0);
        self.last_tick_ms = Some(now);

        match self.state {
            SessionState::Lobby => {
                if !self.handshake_sent && now - self.created_ms >= self.config.ready_timeout_ms {
                    self.abort_handshake();
                    return Err(SessionError::HandshakeTimeout);
                }
            }
            SessionState::Running => {
                for output in self.lockstep.advance(dt) {
                    self.broadcast_turn(&output);
                }
                if let Some(first) = self.first_finish_ms {
                    if now - first >= self.config.finish_timeout_ms {
                        warn!(session = %hex::encode(&self.id[..4]), "finish confirmation timed out");
                        self.end_session();
                    }
                }
            }
            SessionState::Ended | SessionState::Aborted | SessionState::Closed => {}
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent, now: i64) {
        match event {
            TransportEvent::Connected { client } => self.on_connected(client),
            TransportEvent::Disconnected { client } => {
                if let Some(slot) = self.slots.get_mut(&client) {
                    slot.connected = false;
                    // Broadcasts stop until the client re-signals ready,
                    // which is what triggers the turn replay. Without
                    // this a live empty-turn batch could reach the
                    // rejoining client ahead of its replay and corrupt
                    // its turn accounting.
                    slot.ready = false;
                    info!(client, player = slot.player, "client disconnected");
                }
            }
            TransportEvent::Message { sender, payload } => {
                match Message::decode(&payload) {
                    Ok(message) => self.on_message(sender, message, now),
                    Err(error) => self.on_malformed(sender, error),
                }
            }
            TransportEvent::Error(error) => {
                warn!(%error, "transport error reported to session");
            }
        }
    }

    fn on_connected(&mut self, client: ClientId) {
        let player = match self.slots.get_mut(&client) {
            Some(slot) => {
                // Same transport id coming back: a reconnection.
                slot.connected = true;
                slot.connections += 1;
                info!(client, player = slot.player, connections = slot.connections, "client reconnected");
                slot.player
            }
            None => {
                let player = self.free_player_number();
                self.slots.insert(
                    client,
                    ClientSlot {
                        client,
                        player,
                        ready: false,
                        connected: true,
                        connections: 1,
                        finished: None,
                        malformed: 0,
                    },
                );
                player
            }
        };
        info!(client, player, "client connected");

        let setup = Message::ClientSetup(ClientSetup {
            client_id: client,
            player,
            command_step_ms: self.config.lockstep.command_step_ms,
            simulation_step_ms: self.config.lockstep.simulation_step_ms,
            simulation_delay_ms: self.config.lockstep.simulation_delay_ms,
            random_seed: self.config.lockstep.random_seed,
        });
        self.send(client, &setup);
    }

    fn free_player_number(&self) -> PlayerNum {
        let mut num: PlayerNum = 0;
        while self.slots.values().any(|slot| slot.player == num) {
            num += 1;
        }
        num
    }

    fn on_malformed(&mut self, sender: ClientId, error: CodecError) {
        if let Some(slot) = self.slots.get_mut(&sender) {
            slot.malformed += 1;
            warn!(
                client = sender,
                count = slot.malformed,
                %error,
                "malformed message discarded"
            );
        }
    }

    fn on_message(&mut self, sender: ClientId, message: Message, now: i64) {
        match message {
            Message::Command(record) => self.on_command(sender, record),
            Message::PlayerReady(ready) => self.on_player_ready(sender, ready.current_turn, now),
            Message::PlayerFinish { result } => self.on_player_finish(sender, result, now),
            Message::Ping { timestamp } => {
                let pong = Message::Pong {
                    timestamp,
                    server_time: now,
                };
                if let Err(error) =
                    self.transport
                        .send_to(sender, ChannelKind::Unreliable, &pong.encode())
                {
                    // Probe loss is tolerated.
                    debug!(client = sender, %error, "pong dropped");
                }
            }
            other => {
                debug!(client = sender, tag = other.tag(), "unexpected message ignored");
            }
        }
    }

    fn on_command(&mut self, sender: ClientId, mut record: CommandRecord) {
        let Some(slot) = self.slots.get(&sender) else {
            return;
        };
        if !slot.ready || self.state != SessionState::Running {
            // Only ready clients of a running session may submit.
            return;
        }
        // Never trust the sender's claimed player number.
        record.player = slot.player;
        let player = slot.player;
        let seq = record.seq;

        // Acks are idempotent: retransmissions are re-acked so the sender
        // stops retrying, but the command is applied at most once.
        let ack = Message::CommandAck { seqs: vec![seq] };
        self.send(sender, &ack);

        if self.recv_log.observe(player, seq) {
            if let Err(error) = self.lockstep.add_command(record) {
                warn!(client = sender, %error, "command rejected");
            }
        }
    }

    fn on_player_ready(&mut self, sender: ClientId, current_turn: u32, now: i64) {
        let Some(slot) = self.slots.get_mut(&sender) else {
            return;
        };
        let was_ready = slot.ready;
        slot.ready = true;
        let player = slot.player;

        match self.state {
            SessionState::Running => {
                // Reconnection (or a late ready): schedule this client
                // relative to the running session and replay what it missed.
                info!(client = sender, player, current_turn, "client rejoining running session");
                self.send_start_to(sender, now);
                self.replay_turns(sender, current_turn);
            }
            SessionState::Lobby => {
                debug!(client = sender, player, was_ready, "player ready");
                if self.all_players_ready() && !self.handshake_sent {
                    self.start_session(now);
                }
            }
            _ => {}
        }
    }

    fn start_session(&mut self, now: i64) {
        // Fires exactly once, and only with the full expected player set.
        self.handshake_sent = true;
        self.state = SessionState::Running;

        let players: Vec<PlayerNum> = {
            let mut players: Vec<PlayerNum> =
                self.slots.values().map(|slot| slot.player).collect();
            players.sort_unstable();
            players
        };
        let start = Message::ClientStart(ClientStart {
            server_timestamp: now as i32,
            remaining_ms: self.config.start_delay_ms,
            players,
        });
        let targets: Vec<ClientId> = self
            .slots
            .values()
            .filter(|slot| slot.ready && slot.connected)
            .map(|slot| slot.client)
            .collect();
        for client in targets {
            self.send(client, &start);
        }

        // The authority leads the clients by the buffering delay so turn
        // data is always in flight before a client needs it.
        let lead = self.config.lockstep.simulation_delay_ms as i64
            - self.config.start_delay_ms as i64;
        self.lockstep.start(lead);
        self.last_tick_ms = Some(now);
        info!(
            session = %hex::encode(&self.id[..4]),
            players = self.slots.len(),
            start_delay_ms = self.config.start_delay_ms,
            "ready handshake broadcast, session running"
        );
    }

    fn send_start_to(&mut self, client: ClientId, now: i64) {
        // A rejoining client starts its clock where the session already
        // is: remaining is negative once the start moment has passed.
        let client_update_time =
            self.lockstep.time_ms() - self.config.lockstep.simulation_delay_ms as i64;
        let players: Vec<PlayerNum> = {
            let mut players: Vec<PlayerNum> =
                self.slots.values().map(|slot| slot.player).collect();
            players.sort_unstable();
            players
        };
        let start = Message::ClientStart(ClientStart {
            server_timestamp: now as i32,
            remaining_ms: (-client_update_time) as i32,
            players,
        });
        self.send(client, &start);
    }

    fn replay_turns(&mut self, client: ClientId, from: u32) {
        match self.lockstep.turns_since(from) {
            Some(turns) => {
                debug!(client, from, count = turns.len(), "replaying turns");
                // Replayed turns are always sent with explicit numbers,
                // empty ones included: the receiver can then discard
                // stale duplicates, which an unnumbered empty-turn batch
                // would not allow.
                for turn in turns {
                    self.send(client, &Message::Turn(turn));
                }
            }
            None => {
                // Beyond the retained window: the client must perform a
                // full state resync, which is a terminal condition here.
                warn!(client, from, "reconnect gap exceeds turn history");
                self.send(
                    client,
                    &Message::ClientEnd {
                        result: RESYNC_REQUIRED_RESULT.to_vec(),
                    },
                );
            }
        }
    }

    fn on_player_finish(&mut self, sender: ClientId, result: Vec<u8>, now: i64) {
        let Some(slot) = self.slots.get_mut(&sender) else {
            return;
        };
        if slot.finished.is_some() {
            // Duplicate finish messages are ignored.
            return;
        }
        slot.finished = Some(result);
        if self.first_finish_ms.is_none() {
            self.first_finish_ms = Some(now);
        }

        let all_finished = self
            .slots
            .values()
            .filter(|slot| slot.ready)
            .all(|slot| slot.finished.is_some());
        if self.state == SessionState::Running && all_finished {
            self.end_session();
        }
    }

    fn end_session(&mut self) {
        self.lockstep.stop();
        self.state = SessionState::Ended;
        let notifications: Vec<(ClientId, Vec<u8>)> = self
            .slots
            .values()
            .filter(|slot| slot.connected)
            .map(|slot| (slot.client, slot.finished.clone().unwrap_or_default()))
            .collect();
        for (client, result) in notifications {
            self.send(client, &Message::ClientEnd { result });
        }
        info!(session = %hex::encode(&self.id[..4]), "session ended");
    }

    fn abort_handshake(&mut self) {
        self.state = SessionState::Aborted;
        let targets: Vec<ClientId> = self
            .slots
            .values()
            .filter(|slot| slot.connected)
            .map(|slot| slot.client)
            .collect();
        for client in targets {
            self.send(
                client,
                &Message::ClientEnd {
                    result: HANDSHAKE_TIMEOUT_RESULT.to_vec(),
                },
            );
        }
        warn!(
            session = %hex::encode(&self.id[..4]),
            ready = self.slots.values().filter(|s| s.ready).count(),
            expected = self.config.expected_players,
            "ready handshake timed out, session aborted"
        );
    }

    fn broadcast_turn(&mut self, output: &ServerTurn) {
        let message = match output {
            ServerTurn::Turn(turn) => Message::Turn(turn.clone()),
            ServerTurn::EmptyTurns { count } => Message::EmptyTurns { count: *count },
        };
        let targets: Vec<ClientId> = self
            .slots
            .values()
            .filter(|slot| slot.ready && slot.connected)
            .map(|slot| slot.client)
            .collect();
        for client in targets {
            self.send(client, &message);
        }
    }

    fn send(&mut self, client: ClientId, message: &Message) {
        if let Err(error) = self
            .transport
            .send_to(client, ChannelKind::Reliable, &message.encode())
        {
            warn!(client, %error, "send failed");
        }
    }
}
