//! Protocol Messages
//!
//! Composite wire records exchanged between clients and the session
//! authority. Every transport payload is a one-byte message type tag
//! followed by the message body; [`Message::encode`] and
//! [`Message::decode`] are exact inverses for every variant.

use crate::codec::wire::{CodecError, WireReader, WireWriter};

/// Player number within a session. Assigned by the authority.
pub type PlayerNum = u8;

/// Stable wire tags for every message type.
pub mod msg_type {
    /// Command submission (client -> authority).
    pub const COMMAND: u8 = 2;
    /// Finalized turn batch (authority -> clients).
    pub const TURN: u8 = 3;
    /// Run of consecutive turns with no commands (authority -> clients).
    pub const EMPTY_TURNS: u8 = 4;
    /// Per-client setup sent on connect (authority -> client).
    pub const CLIENT_SETUP: u8 = 5;
    /// Readiness signal (client -> authority).
    pub const PLAYER_READY: u8 = 6;
    /// Ready handshake / start broadcast (authority -> clients).
    pub const CLIENT_START: u8 = 7;
    /// End-of-session result submission (client -> authority).
    pub const PLAYER_FINISH: u8 = 8;
    /// Session end notification (authority -> client).
    pub const CLIENT_END: u8 = 9;
    /// Command acknowledgement batch (authority -> sender).
    pub const COMMAND_ACK: u8 = 10;
    /// Latency probe (client -> authority, unreliable).
    pub const PING: u8 = 11;
    /// Latency probe reply (authority -> client, unreliable).
    pub const PONG: u8 = 12;
}

/// A player command as it travels on the wire.
///
/// `type_id` and `payload` are the application-defined command; `player`
/// and `seq` are the synchronization bookkeeping that must agree on every
/// peer. The authority overwrites `player` with the sender's assigned
/// number before finalizing a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Registered command type identifier.
    pub type_id: i32,
    /// Opaque serialized command payload.
    pub payload: Vec<u8>,
    /// Player the command belongs to.
    pub player: PlayerNum,
    /// Per-sender sequence number assigned by the command queue.
    pub seq: u32,
}

impl CommandRecord {
    /// Minimum encoded size: type id, length prefix, player, seq.
    pub const MIN_WIRE_SIZE: usize = 4 + 4 + 1 + 4;

    fn write(&self, w: &mut WireWriter) {
        w.write_i32(self.type_id);
        w.write_bytes(&self.payload);
        w.write_u8(self.player);
        w.write_u32(self.seq);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let type_id = r.read_i32()?;
        let payload = r.read_bytes()?;
        let player = r.read_u8()?;
        let seq = r.read_u32()?;
        Ok(Self {
            type_id,
            payload,
            player,
            seq,
        })
    }
}

/// A finalized turn: a number and the ordered commands it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    /// Turn number. Monotonic from 0 with no gaps.
    pub number: u32,
    /// Commands in the authority's finalized order.
    pub commands: Vec<CommandRecord>,
}

impl TurnRecord {
    /// Create an empty turn.
    pub fn empty(number: u32) -> Self {
        Self {
            number,
            commands: Vec::new(),
        }
    }

    /// True if the turn carries no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Per-client setup delivered when a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSetup {
    /// Transport client identifier assigned to the connection.
    pub client_id: u8,
    /// Player number assigned to the client for this session.
    pub player: PlayerNum,
    /// Duration of one turn in milliseconds.
    pub command_step_ms: i32,
    /// Duration of one simulation step in milliseconds.
    pub simulation_step_ms: i32,
    /// Turn buffering lead time in milliseconds.
    pub simulation_delay_ms: i32,
    /// Seed shared by all peers for deterministic randomness.
    pub random_seed: i64,
}

/// Readiness signal. `current_turn` is the next turn the client needs;
/// a value above zero marks a reconnection and requests replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerReady {
    /// Next turn number the client expects to apply.
    pub current_turn: u32,
}

/// The ready handshake. Clients start their scheduler clock relative to
/// `server_timestamp`, not their own receipt time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStart {
    /// Authority clock (milliseconds) when the message was built.
    pub server_timestamp: i32,
    /// Milliseconds until the simulation formally starts. Negative when
    /// sent to a reconnecting client of a session already in progress.
    pub remaining_ms: i32,
    /// Player numbers participating in the session.
    pub players: Vec<PlayerNum>,
}

/// Messages exchanged by the synchronization protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Command submission.
    Command(CommandRecord),
    /// Finalized turn batch.
    Turn(TurnRecord),
    /// `count` consecutive empty turns.
    EmptyTurns {
        /// Number of empty turns the batch stands for.
        count: u32,
    },
    /// Per-client setup.
    ClientSetup(ClientSetup),
    /// Readiness signal.
    PlayerReady(PlayerReady),
    /// Ready handshake broadcast.
    ClientStart(ClientStart),
    /// End-of-session result submission (opaque blob).
    PlayerFinish {
        /// Application-defined result payload.
        result: Vec<u8>,
    },
    /// Session end notification (opaque blob).
    ClientEnd {
        /// Application-defined result payload.
        result: Vec<u8>,
    },
    /// Acknowledged command sequence numbers.
    CommandAck {
        /// Sequence numbers applied by the authority.
        seqs: Vec<u32>,
    },
    /// Latency probe.
    Ping {
        /// Sender clock at transmission.
        timestamp: i64,
    },
    /// Latency probe reply.
    Pong {
        /// Echoed sender clock.
        timestamp: i64,
        /// Authority clock at reply.
        server_time: i64,
    },
}

impl Message {
    /// The wire tag of this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::Command(_) => msg_type::COMMAND,
            Message::Turn(_) => msg_type::TURN,
            Message::EmptyTurns { .. } => msg_type::EMPTY_TURNS,
            Message::ClientSetup(_) => msg_type::CLIENT_SETUP,
            Message::PlayerReady(_) => msg_type::PLAYER_READY,
            Message::ClientStart(_) => msg_type::CLIENT_START,
            Message::PlayerFinish { .. } => msg_type::PLAYER_FINISH,
            Message::ClientEnd { .. } => msg_type::CLIENT_END,
            Message::CommandAck { .. } => msg_type::COMMAND_ACK,
            Message::Ping { .. } => msg_type::PING,
            Message::Pong { .. } => msg_type::PONG,
        }
    }

    /// Encode the message, tag byte included.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(16);
        w.write_u8(self.tag());
        match self {
            Message::Command(cmd) => cmd.write(&mut w),
            Message::Turn(turn) => {
                w.write_i32(turn.number as i32);
                w.write_i32(turn.commands.len() as i32);
                for cmd in &turn.commands {
                    cmd.write(&mut w);
                }
            }
            Message::EmptyTurns { count } => {
                w.write_i32(*count as i32);
            }
            Message::ClientSetup(setup) => {
                w.write_u8(setup.client_id);
                w.write_u8(setup.player);
                w.write_i32(setup.command_step_ms);
                w.write_i32(setup.simulation_step_ms);
                w.write_i32(setup.simulation_delay_ms);
                w.write_i64(setup.random_seed);
            }
            Message::PlayerReady(ready) => {
                w.write_i32(ready.current_turn as i32);
            }
            Message::ClientStart(start) => {
                w.write_i32(start.server_timestamp);
                w.write_i32(start.remaining_ms);
                w.write_i32(start.players.len() as i32);
                for player in &start.players {
                    w.write_u8(*player);
                }
            }
            Message::PlayerFinish { result } | Message::ClientEnd { result } => {
                w.write_bytes(result);
            }
            Message::CommandAck { seqs } => {
                w.write_i32(seqs.len() as i32);
                for seq in seqs {
                    w.write_u32(*seq);
                }
            }
            Message::Ping { timestamp } => {
                w.write_i64(*timestamp);
            }
            Message::Pong {
                timestamp,
                server_time,
            } => {
                w.write_i64(*timestamp);
                w.write_i64(*server_time);
            }
        }
        w.into_bytes()
    }

    /// Decode a message from a full payload, tag byte included.
    ///
    /// Fails with a [`CodecError`] on unknown tags, truncated bodies,
    /// out-of-range lengths or trailing bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        if r.is_empty() {
            return Err(CodecError::EmptyMessage);
        }
        let tag = r.read_u8()?;
        let msg = match tag {
            msg_type::COMMAND => Message::Command(CommandRecord::read(&mut r)?),
            msg_type::TURN => {
                let number = read_turn_number(&mut r)?;
                let count = r.read_count(CommandRecord::MIN_WIRE_SIZE)?;
                let mut commands = Vec::with_capacity(count);
                for _ in 0..count {
                    commands.push(CommandRecord::read(&mut r)?);
                }
                Message::Turn(TurnRecord { number, commands })
            }
            msg_type::EMPTY_TURNS => {
                let count = r.read_i32()?;
                if count < 0 {
                    return Err(CodecError::CountOutOfRange {
                        declared: count as i64,
                        remaining: r.remaining(),
                    });
                }
                Message::EmptyTurns {
                    count: count as u32,
                }
            }
            msg_type::CLIENT_SETUP => Message::ClientSetup(ClientSetup {
                client_id: r.read_u8()?,
                player: r.read_u8()?,
                command_step_ms: r.read_i32()?,
                simulation_step_ms: r.read_i32()?,
                simulation_delay_ms: r.read_i32()?,
                random_seed: r.read_i64()?,
            }),
            msg_type::PLAYER_READY => Message::PlayerReady(PlayerReady {
                current_turn: read_turn_number(&mut r)?,
            }),
            msg_type::CLIENT_START => {
                let server_timestamp = r.read_i32()?;
                let remaining_ms = r.read_i32()?;
                let count = r.read_count(1)?;
                let mut players = Vec::with_capacity(count);
                for _ in 0..count {
                    players.push(r.read_u8()?);
                }
                Message::ClientStart(ClientStart {
                    server_timestamp,
                    remaining_ms,
                    players,
                })
            }
            msg_type::PLAYER_FINISH => Message::PlayerFinish {
                result: r.read_bytes()?,
            },
            msg_type::CLIENT_END => Message::ClientEnd {
                result: r.read_bytes()?,
            },
            msg_type::COMMAND_ACK => {
                let count = r.read_count(4)?;
                let mut seqs = Vec::with_capacity(count);
                for _ in 0..count {
                    seqs.push(r.read_u32()?);
                }
                Message::CommandAck { seqs }
            }
            msg_type::PING => Message::Ping {
                timestamp: r.read_i64()?,
            },
            msg_type::PONG => Message::Pong {
                timestamp: r.read_i64()?,
                server_time: r.read_i64()?,
            },
            other => return Err(CodecError::UnknownMessageType(other)),
        };
        r.expect_end()?;
        Ok(msg)
    }
}

fn read_turn_number(r: &mut WireReader<'_>) -> Result<u32, CodecError> {
    let number = r.read_i32()?;
    if number < 0 {
        return Err(CodecError::CountOutOfRange {
            declared: number as i64,
            remaining: r.remaining(),
        });
    }
    Ok(number as u32)
}
