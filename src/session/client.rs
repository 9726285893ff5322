//! Session Client
//!
//! Client-side wiring of transport, command queue and turn scheduler. The
//! owner drives [`SessionClient::tick`] from its update loop; everything
//! else - setup, the start handshake, turn confirmation, command
//! retransmission and resync requests - happens inside.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::{Message, PlayerNum, PlayerReady};
use crate::lockstep::{
    LockstepClient, LockstepConfig, LockstepError, SchedulerConfig, SchedulerEvent, SchedulerState,
};
use crate::queue::{CommandQueue, CompletionFn, QueueConfig};
use crate::transport::{ChannelKind, ClientTransport, EventReceiver, TransportEvent};

/// Notifications surfaced to the application from one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSessionEvent {
    /// The authority assigned identifiers and cadence.
    SetupReceived {
        /// Assigned player number.
        player: PlayerNum,
    },
    /// The start handshake arrived; the simulation begins in
    /// `start_in_ms` milliseconds of authority-relative time.
    StartScheduled {
        /// Milliseconds until the simulation formally starts (negative
        /// when rejoining a session already past its start).
        start_in_ms: i64,
        /// Participating player numbers.
        players: Vec<PlayerNum>,
    },
    /// A scheduler outcome (simulation step, applied turn, stall...).
    Scheduler(SchedulerEvent),
    /// The session ended; the payload is the authority's result blob.
    Ended {
        /// Application-defined result payload.
        result: Vec<u8>,
    },
    /// The transport connection dropped. Buffered commands are retained
    /// and transmission resumes after reconnection.
    ConnectionLost,
}

/// Client-side session driver.
pub struct SessionClient<T: ClientTransport> {
    transport: T,
    events: EventReceiver,
    clock: Arc<dyn Clock>,
    scheduler: LockstepClient,
    queue: CommandQueue,
    setup_received: bool,
    ready_pending: bool,
    pending_finish: Option<Vec<u8>>,
    finish_sent: bool,
    ended: bool,
    last_tick_ms: Option<i64>,
}

impl<T: ClientTransport> SessionClient<T> {
    /// Wire a transport to a fresh scheduler and command queue.
    pub fn new(
        transport: T,
        events: EventReceiver,
        clock: Arc<dyn Clock>,
        tuning: SchedulerConfig,
        queue_config: QueueConfig,
    ) -> Self {
        let mut scheduler = LockstepClient::new(LockstepConfig::default(), tuning);
        scheduler.set_networked(true);
        Self {
            transport,
            events,
            clock,
            scheduler,
            queue: CommandQueue::new(0, queue_config),
            setup_received: false,
            ready_pending: false,
            pending_finish: None,
            finish_sent: false,
            ended: false,
            last_tick_ms: None,
        }
    }

    /// The scheduler, for command registration and state inspection.
    pub fn scheduler(&self) -> &LockstepClient {
        &self.scheduler
    }

    /// Mutable scheduler access.
    pub fn scheduler_mut(&mut self) -> &mut LockstepClient {
        &mut self.scheduler
    }

    /// Assigned player number (0 until setup arrives).
    pub fn player(&self) -> PlayerNum {
        self.scheduler.player()
    }

    /// True when no command is pending or awaiting acknowledgement.
    pub fn synced(&self) -> bool {
        self.queue.synced()
    }

    /// True after the authority's end notification.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Signal readiness. Sent as soon as setup has arrived (immediately
    /// if it already has).
    pub fn send_ready(&mut self) {
        self.ready_pending = true;
    }

    /// Attach a fresh connection after a transport loss. Scheduler and
    /// queue state survive, so buffered commands resume transmission and
    /// the authority replays missed turns once readiness is re-signalled.
    pub fn reconnect(&mut self, transport: T, events: EventReceiver) {
        self.transport = transport;
        self.events = events;
        self.setup_received = false;
        self.queue.start();
    }

    /// Submit a command for inclusion in a future turn. `on_finished`
    /// fires once the authority acknowledges the command.
    pub fn submit(
        &mut self,
        type_id: i32,
        payload: Vec<u8>,
        on_finished: Option<CompletionFn>,
    ) -> Result<u32, LockstepError> {
        if self.scheduler.state() != SchedulerState::Running {
            return Err(LockstepError::NotAccepting);
        }
        Ok(self.queue.add(type_id, payload, on_finished))
    }

    /// Submit an end-of-session result. The queue is flushed first so no
    /// command is lost to the teardown.
    pub fn finish(&mut self, result: Vec<u8>) {
        self.pending_finish = Some(result);
        self.queue.flush(None);
    }

    /// Advance the session: drain transport events, run the scheduler and
    /// the command queue's send loop.
    pub fn tick(&mut self) -> Vec<ClientSessionEvent> {
        let now = self.clock.now_ms();
        let mut out = Vec::new();

        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        for event in events {
            self.handle_event(event, now, &mut out);
        }

        // A start handled above re-bases the clock, so the pre-start
        // remainder of this tick never reaches the scheduler.
        let dt = self
            .last_tick_ms
            .map(|last| (now - last).max(0))
            .unwrap_or(0);
        self.last_tick_ms = Some(now);

        self.try_send_ready();

        for event in self.scheduler.advance(dt) {
            out.push(ClientSessionEvent::Scheduler(event));
        }

        for payload in self.queue.tick(now) {
            if let Err(error) = self.transport.send(ChannelKind::Reliable, &payload) {
                // Retry cadence picks the command up again.
                debug!(%error, "command transmission deferred");
                break;
            }
        }

        if let Some(result) = self.pending_finish.take() {
            if self.queue.synced() && !self.finish_sent {
                self.finish_sent = true;
                let msg = Message::PlayerFinish { result };
                if let Err(error) = self.transport.send(ChannelKind::Reliable, &msg.encode()) {
                    warn!(%error, "finish submission failed");
                    self.finish_sent = false;
                    if let Message::PlayerFinish { result } = msg {
                        self.pending_finish = Some(result);
                    }
                }
            } else if !self.finish_sent {
                self.pending_finish = Some(result);
            }
        }

        out
    }

    fn handle_event(&mut self, event: TransportEvent, now: i64, out: &mut Vec<ClientSessionEvent>) {
        match event {
            TransportEvent::Connected { .. } => {
                // Setup is re-sent by the authority after every connect.
                self.setup_received = false;
            }
            TransportEvent::Disconnected { .. } => {
                self.setup_received = false;
                self.queue.stop();
                out.push(ClientSessionEvent::ConnectionLost);
            }
            TransportEvent::Message { payload, .. } => match Message::decode(&payload) {
                Ok(message) => self.handle_message(message, now, out),
                Err(error) => {
                    warn!(%error, "malformed message discarded");
                }
            },
            TransportEvent::Error(error) => {
                warn!(%error, "transport error");
            }
        }
    }

    fn handle_message(&mut self, message: Message, now: i64, out: &mut Vec<ClientSessionEvent>) {
        match message {
            Message::ClientSetup(setup) => {
                self.scheduler.set_config(LockstepConfig {
                    command_step_ms: setup.command_step_ms,
                    simulation_step_ms: setup.simulation_step_ms,
                    simulation_delay_ms: setup.simulation_delay_ms,
                    random_seed: setup.random_seed,
                });
                self.scheduler.set_player(setup.player);
                self.queue.set_player(setup.player);
                self.queue.start();
                self.setup_received = true;
                info!(player = setup.player, client = setup.client_id, "setup received");
                out.push(ClientSessionEvent::SetupReceived {
                    player: setup.player,
                });
                self.try_send_ready();
            }
            Message::ClientStart(start) => {
                // Start relative to the authority's clock: local receipt
                // time is corrected by the measured transit delay.
                let delay = self.transport.delay_ms(start.server_timestamp as i64);
                let start_time = -(start.remaining_ms as i64) + delay;
                if self.scheduler.state() == SchedulerState::Idle {
                    let _ = self.scheduler.await_ready();
                }
                match self.scheduler.start(start_time) {
                    Ok(()) => {
                        // Scheduler time is relative to this instant.
                        self.last_tick_ms = Some(now);
                        info!(
                            start_in_ms = -start_time,
                            players = start.players.len(),
                            "start scheduled"
                        );
                        out.push(ClientSessionEvent::StartScheduled {
                            start_in_ms: -start_time,
                            players: start.players,
                        });
                    }
                    Err(error) => {
                        debug!(%error, "duplicate start ignored");
                    }
                }
            }
            Message::Turn(turn) => {
                if turn.number < self.scheduler.expected_turn() {
                    // Stale duplicate (a replay overlapping turns already
                    // confirmed); not a gap.
                    debug!(number = turn.number, "stale turn discarded");
                } else if self.scheduler.confirm_turn(turn).is_err() {
                    self.request_resync();
                }
            }
            Message::EmptyTurns { count } => {
                // An empty-turn batch carries no turn number, so it is
                // only meaningful while the confirmed timeline is
                // contiguous; during a resync the replay supplies the
                // missing turns explicitly numbered.
                if self.scheduler.needs_resync() {
                    debug!(count, "empty turns discarded during resync");
                } else {
                    self.scheduler.confirm_empty_turns(count);
                }
            }
            Message::CommandAck { seqs } => {
                self.queue.handle_ack(&seqs);
            }
            Message::ClientEnd { result } => {
                self.ended = true;
                self.queue.stop();
                self.scheduler.stop();
                out.push(ClientSessionEvent::Ended { result });
            }
            other => {
                debug!(tag = other.tag(), "unexpected message ignored");
            }
        }
    }

    fn try_send_ready(&mut self) {
        if !self.ready_pending || !self.setup_received {
            return;
        }
        self.ready_pending = false;
        if self.scheduler.state() == SchedulerState::Idle {
            let _ = self.scheduler.await_ready();
        }
        let msg = Message::PlayerReady(PlayerReady {
            current_turn: self.scheduler.expected_turn(),
        });
        if let Err(error) = self.transport.send(ChannelKind::Reliable, &msg.encode()) {
            warn!(%error, "ready signal failed, will retry");
            self.ready_pending = true;
        }
    }

    fn request_resync(&mut self) {
        let msg = Message::PlayerReady(PlayerReady {
            current_turn: self.scheduler.expected_turn(),
        });
        if let Err(error) = self.transport.send(ChannelKind::Reliable, &msg.encode()) {
            warn!(%error, "resync request failed");
        }
    }
}
