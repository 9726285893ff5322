//! Turn Buffer
//!
//! Confirmed turns waiting to be applied, keyed by turn number. Turns must
//! arrive contiguously: confirming a number other than the next expected
//! one is a [`TurnGap`](crate::lockstep::LockstepError::TurnGap), the
//! fatal missing-turn condition that triggers a resync instead of a guess.

use std::collections::BTreeMap;

use crate::codec::TurnRecord;
use crate::lockstep::LockstepError;

/// Ordered buffer of confirmed turns.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    /// Non-empty confirmed turns, keyed by number. Empty turns are only
    /// counted, not stored.
    turns: BTreeMap<u32, TurnRecord>,
    /// Next turn number a confirmation must carry.
    next_expected: u32,
}

impl TurnBuffer {
    /// Create an empty buffer expecting turn 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next turn number a confirmation must carry.
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Highest confirmed turn number, if any turn was confirmed yet.
    pub fn last_confirmed(&self) -> Option<u32> {
        self.next_expected.checked_sub(1)
    }

    /// True if the given turn has been confirmed (and may be taken).
    pub fn is_confirmed(&self, number: u32) -> bool {
        number < self.next_expected
    }

    /// Confirm the next turn. The number must be exactly contiguous.
    pub fn confirm(&mut self, turn: TurnRecord) -> Result<(), LockstepError> {
        if turn.number != self.next_expected {
            return Err(LockstepError::TurnGap {
                expected: self.next_expected,
                received: turn.number,
            });
        }
        if !turn.is_empty() {
            self.turns.insert(turn.number, turn);
        }
        self.next_expected += 1;
        Ok(())
    }

    /// Confirm `count` consecutive empty turns.
    pub fn confirm_empty(&mut self, count: u32) {
        self.next_expected += count;
    }

    /// Remove and return a confirmed turn. Turns confirmed as empty (or
    /// batched in an empty-turns run) come back as empty records.
    ///
    /// Returns `None` when the turn has not been confirmed yet.
    pub fn take(&mut self, number: u32) -> Option<TurnRecord> {
        if !self.is_confirmed(number) {
            return None;
        }
        Some(
            self.turns
                .remove(&number)
                .unwrap_or_else(|| TurnRecord::empty(number)),
        )
    }

    /// Confirmed-but-unapplied depth relative to the given turn.
    pub fn buffered_ahead(&self, current: u32) -> u32 {
        self.next_expected.saturating_sub(current)
    }

    /// Discard everything and start expecting turn 0 again.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.next_expected = 0;
    }
}
