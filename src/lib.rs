//! # Lockstep Engine
//!
//! Deterministic lockstep multiplayer synchronization: N independent
//! clients compute identical simulation state by agreeing, turn by turn,
//! on exactly which commands occurred in exactly which order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      LOCKSTEP ENGINE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  codec/          - Wire format                               │
//! │  ├── wire.rs     - Big-endian primitives, length prefixes    │
//! │  └── message.rs  - Protocol messages (commands, turns,       │
//! │                    handshake, acks)                          │
//! │                                                              │
//! │  transport/      - Network abstraction                       │
//! │  ├── memory.rs   - Deterministic in-process hub              │
//! │  └── ws.rs       - tokio WebSocket server/client             │
//! │                                                              │
//! │  queue/          - Reliable command queue                    │
//! │                    (sequence numbers, retry, ack dedup)      │
//! │                                                              │
//! │  lockstep/       - Turn scheduler (deterministic)            │
//! │  ├── client.rs   - Scheduler state machine                   │
//! │  ├── server.rs   - Authoritative turn accumulation           │
//! │  ├── command.rs  - Type-id command registry                  │
//! │  └── turn.rs     - Contiguous turn buffer                    │
//! │                                                              │
//! │  session/        - Session layer                             │
//! │  ├── coordinator.rs - Server authority per session           │
//! │  ├── client.rs   - Client-side wiring                        │
//! │  └── manager.rs  - Concurrent isolated sessions              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Correctness Property
//!
//! Turn numbers are monotonic and universally agreed: no two peers ever
//! advance their simulation with a different command set for the same
//! turn number. Everything in `lockstep/` is deterministic - no ambient
//! time, no ambient randomness, no iteration-order surprises (`BTreeMap`
//! throughout). Time enters through an injected [`clock::Clock`], turns
//! through explicit confirmations; a missing turn stalls the scheduler
//! instead of letting peers diverge.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod clock;
pub mod codec;
pub mod lockstep;
pub mod queue;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecError, CommandRecord, Message, PlayerNum, TurnRecord};
pub use lockstep::{
    CommandError, CommandRegistry, LockstepClient, LockstepConfig, LockstepError, SchedulerConfig,
    SchedulerEvent, SchedulerState, ServerLockstep,
};
pub use queue::{CommandQueue, QueueConfig, QueueError, ReceiveLog};
pub use session::{
    ClientSessionEvent, SessionClient, SessionConfig, SessionCoordinator, SessionError, SessionId,
    SessionManager, SessionState,
};
pub use transport::{ChannelKind, ClientId, ClientTransport, ServerTransport, TransportEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
