//! Lockstep Configuration
//!
//! Cadence shared by every peer plus client-local scheduler tuning. The
//! shared values travel in the setup message so all peers step identically;
//! the local values only shape how one client catches up or buffers.

use serde::{Deserialize, Serialize};

/// Cadence every peer must agree on. Distributed by the authority in the
/// setup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Duration of one turn (command step) in milliseconds.
    pub command_step_ms: i32,
    /// Duration of one simulation step in milliseconds. Divides the
    /// command step so several simulation steps run per turn.
    pub simulation_step_ms: i32,
    /// Turn buffering lead time: how far ahead of the clients the
    /// authority finalizes turns to smooth over jitter.
    pub simulation_delay_ms: i32,
    /// Seed shared by all peers for deterministic randomness.
    pub random_seed: i64,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            command_step_ms: 100,
            simulation_step_ms: 20,
            simulation_delay_ms: 1_000,
            random_seed: 0,
        }
    }
}

/// Client-local scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Simulation delay applied to locally finalized commands when no
    /// authority is attached (single-player mode).
    pub local_simulation_delay_ms: i32,
    /// Cap on simulation steps run in a single update. `0` = unbounded.
    /// A capped update leaves the scheduler catching up next tick.
    pub max_simulation_steps_per_update: u32,
    /// Scale applied to incoming wall-clock deltas (fast-forward during
    /// recovery, slow-motion for debugging).
    pub speed_factor: f32,
    /// Sample count for the turn reception duration average.
    pub turn_reception_average_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            local_simulation_delay_ms: 1_000,
            max_simulation_steps_per_update: 0,
            speed_factor: 1.0,
            turn_reception_average_size: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = LockstepConfig::default();
        assert!(config.simulation_step_ms <= config.command_step_ms);
        assert_eq!(config.command_step_ms % config.simulation_step_ms, 0);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = LockstepConfig {
            command_step_ms: 50,
            simulation_step_ms: 10,
            simulation_delay_ms: 500,
            random_seed: 99,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LockstepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
