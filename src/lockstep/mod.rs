//! Lockstep Core
//!
//! The turn scheduler and its supporting types: command registry, turn
//! buffer, shared cadence configuration, the client-side scheduler state
//! machine and the authoritative turn accumulator. Everything in this
//! module is deterministic - no ambient time, no ambient randomness; time
//! arrives as explicit millisecond deltas from the owner.

pub mod client;
pub mod command;
pub mod config;
pub mod server;
pub mod turn;

use thiserror::Error;

pub use client::{BufferStats, LockstepClient, SchedulerEvent, SchedulerState};
pub use command::{CommandError, CommandHandler, CommandRegistry};
pub use config::{LockstepConfig, SchedulerConfig};
pub use server::{ServerLockstep, ServerTurn};
pub use turn::TurnBuffer;

/// Scheduler and authority loop errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockstepError {
    /// A confirmed turn number was not contiguous. Fatal to the local
    /// scheduler; the authority must replay from `expected`.
    #[error("turn gap: expected {expected}, received {received}")]
    TurnGap {
        /// Next turn number the scheduler can accept.
        expected: u32,
        /// Turn number that actually arrived.
        received: u32,
    },

    /// Commands are not accepted in the current state.
    #[error("commands are not accepted in the current state")]
    NotAccepting,

    /// The requested lifecycle transition is not valid.
    #[error("invalid scheduler state for this operation")]
    InvalidState,

    /// The loop is not running.
    #[error("lockstep is not running")]
    NotRunning,
}
