//! Authoritative Turn Accumulation
//!
//! The authority's half of the lockstep loop: commands received within a
//! turn's submission window are finalized, in arrival order, into the
//! numbered turn when the window closes. Finalized turns are retained in a
//! bounded history so reconnecting clients can be replayed; consecutive
//! empty turns are coalesced into a single batch for the wire.

use std::collections::VecDeque;

use tracing::debug;

use crate::codec::{CommandRecord, TurnRecord};
use crate::lockstep::config::LockstepConfig;
use crate::lockstep::LockstepError;

/// A finalized output of the authority loop, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTurn {
    /// A turn carrying commands.
    Turn(TurnRecord),
    /// A run of consecutive turns with no commands.
    EmptyTurns {
        /// Length of the run.
        count: u32,
    },
}

/// Authoritative turn accumulator.
pub struct ServerLockstep {
    config: LockstepConfig,
    history_limit: usize,
    running: bool,
    time_ms: i64,
    last_cmd_ms: i64,
    next_turn: u32,
    /// Commands collected for the turn currently open for submission.
    current: Vec<CommandRecord>,
    /// Finalized turns, oldest first. Empty turns are stored too so a
    /// replay reproduces the exact timeline.
    history: VecDeque<TurnRecord>,
}

impl ServerLockstep {
    /// Create a stopped accumulator.
    pub fn new(config: LockstepConfig, history_limit: usize) -> Self {
        Self {
            config,
            history_limit: history_limit.max(1),
            running: false,
            time_ms: 0,
            last_cmd_ms: 0,
            next_turn: 0,
            current: Vec::new(),
            history: VecDeque::new(),
        }
    }

    /// Shared cadence in effect.
    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// True while the loop is advancing.
    pub fn running(&self) -> bool {
        self.running
    }

    /// Authority time in milliseconds. Negative while the start countdown
    /// runs.
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    /// Number of the turn currently open for submission.
    pub fn current_turn(&self) -> u32 {
        self.next_turn
    }

    /// Begin the loop at `start_time_ms` (negative to lead the clients'
    /// simulation start by the buffering delay).
    pub fn start(&mut self, start_time_ms: i64) {
        self.running = true;
        self.time_ms = start_time_ms;
        self.last_cmd_ms = 0;
        self.next_turn = 0;
        self.current.clear();
        self.history.clear();
        debug!(start_time_ms, "authority lockstep started");
    }

    /// Stop the loop. Open-turn commands are discarded.
    pub fn stop(&mut self) {
        self.running = false;
        self.current.clear();
    }

    /// Accept a command into the open turn. Arrival order is canonical.
    pub fn add_command(&mut self, command: CommandRecord) -> Result<(), LockstepError> {
        if !self.running {
            return Err(LockstepError::NotRunning);
        }
        self.current.push(command);
        Ok(())
    }

    /// Advance authority time, finalizing every turn whose submission
    /// window closed. Returns the outputs to broadcast, with consecutive
    /// empty turns coalesced.
    pub fn advance(&mut self, dt_ms: i64) -> Vec<ServerTurn> {
        let mut out = Vec::new();
        if !self.running || dt_ms < 0 {
            return out;
        }
        self.time_ms += dt_ms;

        let step = self.config.command_step_ms.max(1) as i64;
        let mut empty_run = 0u32;
        while self.last_cmd_ms + step <= self.time_ms {
            self.last_cmd_ms += step;
            let turn = TurnRecord {
                number: self.next_turn,
                commands: std::mem::take(&mut self.current),
            };
            self.next_turn += 1;

            if turn.is_empty() {
                empty_run += 1;
            } else {
                if empty_run > 0 {
                    out.push(ServerTurn::EmptyTurns { count: empty_run });
                    empty_run = 0;
                }
                debug!(number = turn.number, commands = turn.commands.len(), "turn finalized");
                out.push(ServerTurn::Turn(turn.clone()));
            }

            self.history.push_back(turn);
            while self.history.len() > self.history_limit {
                self.history.pop_front();
            }
        }
        if empty_run > 0 {
            out.push(ServerTurn::EmptyTurns { count: empty_run });
        }
        out
    }

    /// Oldest turn number still retained for replay.
    pub fn oldest_retained(&self) -> Option<u32> {
        self.history.front().map(|turn| turn.number)
    }

    /// Replay every finalized turn from `from` onward. Returns `None`
    /// when `from` predates the retained history window, in which case
    /// the client needs a full state resync.
    pub fn turns_since(&self, from: u32) -> Option<Vec<TurnRecord>> {
        if self.history.is_empty() {
            return Some(Vec::new());
        }
        let oldest = self.oldest_retained().expect("non-empty history");
        if from < oldest {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|turn| turn.number >= from)
                .cloned()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LockstepConfig {
        LockstepConfig {
            command_step_ms: 100,
            ..Default::default()
        }
    }

    fn cmd(type_id: i32, player: u8, seq: u32) -> CommandRecord {
        CommandRecord {
            type_id,
            payload: vec![],
            player,
            seq,
        }
    }

    #[test]
    fn test_turns_finalize_on_cadence() {
        let mut server = ServerLockstep::new(config(), 128);
        server.start(0);

        assert!(server.advance(99).is_empty());
        let out = server.advance(1);
        assert_eq!(out, vec![ServerTurn::EmptyTurns { count: 1 }]);
        assert_eq!(server.current_turn(), 1);
    }

    #[test]
    fn test_arrival_order_is_preserved() {
        let mut server = ServerLockstep::new(config(), 128);
        server.start(0);
        for seq in 0..4 {
            server.add_command(cmd(1, 2, seq)).unwrap();
        }
        server.add_command(cmd(9, 1, 0)).unwrap();

        let out = server.advance(100);
        match &out[0] {
            ServerTurn::Turn(turn) => {
                assert_eq!(turn.number, 0);
                let seqs: Vec<(u8, u32)> =
                    turn.commands.iter().map(|c| (c.player, c.seq)).collect();
                assert_eq!(seqs, vec![(2, 0), (2, 1), (2, 2), (2, 3), (1, 0)]);
            }
            other => panic!("expected turn, got {:?}", other),
        }
    }

    #[test]
    fn test_commands_land_in_open_turn() {
        let mut server = ServerLockstep::new(config(), 128);
        server.start(0);
        server.advance(100); // turn 0 closes empty
        server.add_command(cmd(7, 2, 0)).unwrap();

        let out = server.advance(100);
        match &out[0] {
            ServerTurn::Turn(turn) => assert_eq!(turn.number, 1),
            other => panic!("expected turn, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_runs_coalesce() {
        let mut server = ServerLockstep::new(config(), 128);
        server.start(0);
        let out = server.advance(500);
        assert_eq!(out, vec![ServerTurn::EmptyTurns { count: 5 }]);

        server.add_command(cmd(1, 0, 0)).unwrap();
        let out = server.advance(300);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], ServerTurn::Turn(turn) if turn.number == 5));
        assert_eq!(out[1], ServerTurn::EmptyTurns { count: 2 });
    }

    #[test]
    fn test_replay_within_window() {
        let mut server = ServerLockstep::new(config(), 128);
        server.start(0);
        server.advance(300);
        server.add_command(cmd(1, 0, 0)).unwrap();
        server.advance(100);

        let replay = server.turns_since(1).unwrap();
        let numbers: Vec<u32> = replay.iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(replay[2].commands.len(), 1);
    }

    #[test]
    fn test_replay_beyond_window_refused() {
        let mut server = ServerLockstep::new(config(), 4);
        server.start(0);
        server.advance(1000); // 10 turns, only 4 retained

        assert_eq!(server.oldest_retained(), Some(6));
        assert!(server.turns_since(2).is_none());
        assert!(server.turns_since(6).is_some());
    }

    #[test]
    fn test_commands_rejected_when_stopped() {
        let mut server = ServerLockstep::new(config(), 128);
        assert_eq!(
            server.add_command(cmd(1, 0, 0)),
            Err(LockstepError::NotRunning)
        );
    }

    #[test]
    fn test_negative_start_leads_clients() {
        let mut server = ServerLockstep::new(config(), 128);
        // Buffering lead: finalization begins once time crosses zero.
        server.start(-200);
        assert!(server.advance(200).is_empty());
        assert_eq!(server.advance(100), vec![ServerTurn::EmptyTurns { count: 1 }]);
    }
}
