//! Command Queue
//!
//! Turns submitted commands into reliably delivered, exactly-once-applied
//! effects over a transport that may drop, duplicate or reconnect.
//!
//! Outbound side ([`CommandQueue`]): each command gets a monotonically
//! increasing per-sender sequence number and is retransmitted on a bounded
//! backoff until the authority acknowledges it. Completion callbacks fire
//! exactly once on the first acknowledgement; duplicate acks are no-ops.
//!
//! Inbound side ([`ReceiveLog`]): the authority deduplicates `(player,
//! seq)` pairs, giving at-most-once application on top of the queue's
//! at-least-once delivery.
//!
//! The queue is a pure state machine: [`CommandQueue::tick`] returns the
//! payloads due for (re)transmission and the owner hands them to the
//! transport. All mutation happens on the owner's single logical thread.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{CommandRecord, Message, PlayerNum};

/// Queue errors, delivered to completion callbacks and callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The command was removed before transmission.
    #[error("command removed before transmission")]
    Removed,

    /// Queue state was discarded by a reset.
    #[error("queue was reset")]
    Reset,
}

/// Retry and backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Base interval between retransmissions of an unacknowledged command.
    pub retry_interval_ms: i64,
    /// Backoff factor applied per failed attempt.
    pub backoff_multiplier: f32,
    /// Upper bound on the retry interval.
    pub max_retry_interval_ms: i64,
    /// Per-player dedup window kept by [`ReceiveLog`].
    pub receive_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 500,
            backoff_multiplier: 1.5,
            max_retry_interval_ms: 5_000,
            receive_window: 256,
        }
    }
}

/// Completion callback invoked exactly once per command.
pub type CompletionFn = Box<dyn FnOnce(Result<(), QueueError>) + Send>;

/// A command plus its delivery bookkeeping. Owned exclusively by the queue
/// until acknowledged or discarded.
struct PackedCommand {
    record: CommandRecord,
    attempts: u32,
    next_send_at: i64,
    on_finished: Option<CompletionFn>,
}

impl PackedCommand {
    fn retry_interval(&self, config: &QueueConfig) -> i64 {
        let mut interval = config.retry_interval_ms as f64;
        for _ in 1..self.attempts {
            interval *= config.backoff_multiplier as f64;
        }
        (interval as i64).min(config.max_retry_interval_ms)
    }
}

/// Reliable, ordered outbound command buffer with retry and flush.
pub struct CommandQueue {
    config: QueueConfig,
    player: PlayerNum,
    running: bool,
    next_seq: u32,
    /// Accepted but never transmitted. [`CommandQueue::remove`] only
    /// touches these.
    pending: VecDeque<PackedCommand>,
    /// Transmitted at least once, awaiting acknowledgement.
    in_flight: BTreeMap<u32, PackedCommand>,
    /// Flush callbacks, each gated on every seq at or below its watermark.
    flush_waiters: Vec<(u32, CompletionFn)>,
    /// One-shot transmit-now flag set by [`CommandQueue::send`].
    send_requested: bool,
    send_waiters: Vec<CompletionFn>,
}

impl CommandQueue {
    /// Create a stopped queue for the given player.
    pub fn new(player: PlayerNum, config: QueueConfig) -> Self {
        Self {
            config,
            player,
            running: false,
            next_seq: 0,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            flush_waiters: Vec::new(),
            send_requested: false,
            send_waiters: Vec::new(),
        }
    }

    /// The player number stamped onto outgoing commands.
    pub fn player(&self) -> PlayerNum {
        self.player
    }

    /// Update the player number (assigned by the authority at setup).
    pub fn set_player(&mut self, player: PlayerNum) {
        self.player = player;
    }

    /// True when no command is pending or awaiting acknowledgement.
    pub fn synced(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// True while the send loop is active.
    pub fn running(&self) -> bool {
        self.running
    }

    /// Enqueue a command for transmission. Returns its sequence number.
    ///
    /// `on_finished` fires once the authority has acknowledged the command
    /// as applied, or with an error if the command is discarded first.
    pub fn add(
        &mut self,
        type_id: i32,
        payload: Vec<u8>,
        on_finished: Option<CompletionFn>,
    ) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(PackedCommand {
            record: CommandRecord {
                type_id,
                payload,
                player: self.player,
                seq,
            },
            attempts: 0,
            next_send_at: 0,
            on_finished,
        });
        debug!(seq, type_id, "command queued");
        seq
    }

    /// Remove queued-but-not-yet-sent commands matching the predicate.
    /// Returns the number removed. Commands already transmitted or
    /// acknowledged are never touched.
    pub fn remove<F>(&mut self, mut filter: F) -> usize
    where
        F: FnMut(&CommandRecord) -> bool,
    {
        let mut kept = VecDeque::with_capacity(self.pending.len());
        let mut removed = 0;
        while let Some(mut cmd) = self.pending.pop_front() {
            if filter(&cmd.record) {
                removed += 1;
                if let Some(finish) = cmd.on_finished.take() {
                    finish(Err(QueueError::Removed));
                }
            } else {
                kept.push_back(cmd);
            }
        }
        self.pending = kept;
        removed
    }

    /// Force transmission of everything pending and fire `on_finished`
    /// only after the authority has acknowledged the entire batch.
    pub fn flush(&mut self, on_finished: Option<CompletionFn>) {
        self.send_requested = true;
        if let Some(finish) = on_finished {
            if self.synced() {
                finish(Ok(()));
                return;
            }
            // Highest sequence number currently known to the queue.
            let watermark = self.next_seq - 1;
            self.flush_waiters.push((watermark, finish));
        }
    }

    /// Transmit everything pending without waiting for acknowledgement.
    /// `on_finished` fires after the batch has been handed to the
    /// transport on the next tick. Retransmission still applies until the
    /// commands are acknowledged.
    pub fn send(&mut self, on_finished: Option<CompletionFn>) {
        self.send_requested = true;
        if let Some(finish) = on_finished {
            self.send_waiters.push(finish);
        }
    }

    /// Begin the send loop. Buffered commands survive a prior stop.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Halt transmission without losing buffered commands.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Discard all queue state. Pending and in-flight completion callbacks
    /// fire with [`QueueError::Reset`].
    pub fn reset(&mut self) {
        for mut cmd in self.pending.drain(..) {
            if let Some(finish) = cmd.on_finished.take() {
                finish(Err(QueueError::Reset));
            }
        }
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, mut cmd) in in_flight {
            if let Some(finish) = cmd.on_finished.take() {
                finish(Err(QueueError::Reset));
            }
        }
        for (_, finish) in self.flush_waiters.drain(..) {
            finish(Err(QueueError::Reset));
        }
        for finish in self.send_waiters.drain(..) {
            finish(Err(QueueError::Reset));
        }
        self.send_requested = false;
        self.next_seq = 0;
    }

    /// Advance the send loop. Returns encoded `Command` payloads due for
    /// (re)transmission; the caller forwards them on the reliable channel.
    pub fn tick(&mut self, now_ms: i64) -> Vec<Vec<u8>> {
        if !self.running {
            return Vec::new();
        }
        let mut out = Vec::new();
        let force = std::mem::take(&mut self.send_requested);

        // Promote pending commands into flight; order is preserved.
        let mut promoted = BTreeSet::new();
        while let Some(mut cmd) = self.pending.pop_front() {
            cmd.attempts = 1;
            cmd.next_send_at = now_ms + cmd.retry_interval(&self.config);
            out.push(Message::Command(cmd.record.clone()).encode());
            promoted.insert(cmd.record.seq);
            self.in_flight.insert(cmd.record.seq, cmd);
        }

        // Retransmit overdue in-flight commands. A forced send flushes
        // everything regardless of its retry deadline.
        for cmd in self.in_flight.values_mut() {
            if promoted.contains(&cmd.record.seq) {
                continue;
            }
            if force || cmd.next_send_at <= now_ms {
                debug!(seq = cmd.record.seq, attempts = cmd.attempts, "command retry");
                cmd.attempts += 1;
                cmd.next_send_at = now_ms + cmd.retry_interval(&self.config);
                out.push(Message::Command(cmd.record.clone()).encode());
            }
        }

        for finish in self.send_waiters.drain(..) {
            finish(Ok(()));
        }
        out
    }

    /// Process acknowledged sequence numbers. Idempotent: a duplicate ack
    /// for an already-completed command is a no-op.
    pub fn handle_ack(&mut self, seqs: &[u32]) {
        for seq in seqs {
            if let Some(mut cmd) = self.in_flight.remove(seq) {
                debug!(seq, "command acknowledged");
                if let Some(finish) = cmd.on_finished.take() {
                    finish(Ok(()));
                }
            }
        }
        if !self.flush_waiters.is_empty() {
            let waiters = std::mem::take(&mut self.flush_waiters);
            for (watermark, finish) in waiters {
                if self.acked_through(watermark) {
                    finish(Ok(()));
                } else {
                    self.flush_waiters.push((watermark, finish));
                }
            }
        }
    }

    /// True when nothing at or below `watermark` remains unacknowledged.
    fn acked_through(&self, watermark: u32) -> bool {
        self.pending.iter().all(|cmd| cmd.record.seq > watermark)
            && self.in_flight.keys().all(|seq| *seq > watermark)
    }
}

/// Per-player window of applied sequence numbers. The receiving half of
/// the exactly-once contract.
#[derive(Debug, Default)]
pub struct ReceiveLog {
    window: usize,
    players: BTreeMap<PlayerNum, PlayerWindow>,
}

#[derive(Debug, Default)]
struct PlayerWindow {
    /// Every seq at or below this has been applied.
    floor: Option<u32>,
    /// Applied seqs above the floor.
    seen: BTreeSet<u32>,
}

impl ReceiveLog {
    /// Create a log with the given per-player window size.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            players: BTreeMap::new(),
        }
    }

    /// Record a `(player, seq)` pair. Returns `true` if it is new and the
    /// command should be applied, `false` for a duplicate.
    pub fn observe(&mut self, player: PlayerNum, seq: u32) -> bool {
        let entry = self.players.entry(player).or_default();
        if let Some(floor) = entry.floor {
            if seq <= floor {
                warn!(player, seq, "duplicate command ignored");
                return false;
            }
        }
        if !entry.seen.insert(seq) {
            warn!(player, seq, "duplicate command ignored");
            return false;
        }

        // Advance the contiguous floor.
        loop {
            let next = entry.floor.map_or(0, |floor| floor + 1);
            if entry.seen.remove(&next) {
                entry.floor = Some(next);
            } else {
                break;
            }
        }
        // Bound memory for wildly out-of-order senders.
        while entry.seen.len() > self.window {
            let lowest = *entry.seen.iter().next().expect("non-empty set");
            entry.seen.remove(&lowest);
            entry.floor = Some(entry.floor.map_or(lowest, |floor| floor.max(lowest)));
        }
        true
    }

    /// Forget a player's history (hard resync).
    pub fn reset_player(&mut self, player: PlayerNum) {
        self.players.remove(&player);
    }
}
