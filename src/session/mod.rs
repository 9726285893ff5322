//! Session Layer
//!
//! The server authority ([`SessionCoordinator`]) owning the canonical
//! turn timeline, its client-side counterpart ([`SessionClient`]) wiring
//! transport, command queue and scheduler together, and the
//! [`SessionManager`] running many isolated sessions concurrently.

pub mod client;
pub mod coordinator;
pub mod manager;

pub use client::{ClientSessionEvent, SessionClient};
pub use coordinator::{
    SessionConfig, SessionCoordinator, SessionError, SessionId, SessionState,
    HANDSHAKE_TIMEOUT_RESULT, RESYNC_REQUIRED_RESULT,
};
pub use manager::SessionManager;

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::codec::{CommandRecord, Message, PlayerNum};
    use crate::lockstep::{LockstepConfig, SchedulerConfig, SchedulerEvent};
    use crate::queue::QueueConfig;
    use crate::transport::memory::{MemoryClientTransport, MemoryHub, MemoryServerTransport};
    use crate::transport::{ChannelKind, ClientId, ClientTransport, EventReceiver, TransportEvent};

    const SESSION_ID: SessionId = [7; 16];

    fn test_config(expected_players: usize) -> SessionConfig {
        SessionConfig {
            expected_players,
            ready_timeout_ms: 30_000,
            start_delay_ms: 3_000,
            lockstep: LockstepConfig {
                command_step_ms: 100,
                simulation_step_ms: 50,
                simulation_delay_ms: 1_000,
                random_seed: 42,
            },
            ..Default::default()
        }
    }

    struct TestNet {
        hub: MemoryHub,
        clock: ManualClock,
        coordinator: SessionCoordinator<MemoryServerTransport>,
        clients: Vec<SessionClient<MemoryClientTransport>>,
        client_ids: Vec<ClientId>,
    }

    impl TestNet {
        fn new(count: usize, config: SessionConfig) -> Self {
            let clock = ManualClock::new();
            let (hub, server, server_rx) = MemoryHub::new();
            let coordinator = SessionCoordinator::new(
                SESSION_ID,
                config,
                server,
                server_rx,
                Arc::new(clock.clone()),
            );
            let mut clients = Vec::new();
            let mut client_ids = Vec::new();
            for _ in 0..count {
                let (transport, rx) = hub.connect().unwrap();
                client_ids.push(transport.id());
                clients.push(SessionClient::new(
                    transport,
                    rx,
                    Arc::new(clock.clone()),
                    SchedulerConfig::default(),
                    QueueConfig::default(),
                ));
            }
            Self {
                hub,
                clock,
                coordinator,
                clients,
                client_ids,
            }
        }

        /// Advance the whole network by `dt_ms`, ticking the authority
        /// first and every client after it. Returns per-client events.
        fn step(&mut self, dt_ms: i64) -> Vec<Vec<ClientSessionEvent>> {
            self.clock.advance(dt_ms);
            let _ = self.coordinator.tick();
            self.clients.iter_mut().map(|client| client.tick()).collect()
        }

        fn step_n(&mut self, steps: usize, dt_ms: i64) -> Vec<Vec<ClientSessionEvent>> {
            let mut all: Vec<Vec<ClientSessionEvent>> =
                self.clients.iter().map(|_| Vec::new()).collect();
            for _ in 0..steps {
                for (i, events) in self.step(dt_ms).into_iter().enumerate() {
                    all[i].extend(events);
                }
            }
            all
        }
    }

    fn applied_turns(events: &[ClientSessionEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|event| match event {
                ClientSessionEvent::Scheduler(SchedulerEvent::TurnApplied { number, .. }) => {
                    Some(*number)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_fires_once_and_only_complete() {
        let mut net = TestNet::new(3, test_config(3));

        // Setup exchange.
        net.step_n(2, 10);

        // Two of three ready: no start may fire.
        net.clients[0].send_ready();
        net.clients[1].send_ready();
        let events = net.step_n(5, 10);
        for client_events in &events {
            assert!(!client_events
                .iter()
                .any(|e| matches!(e, ClientSessionEvent::StartScheduled { .. })));
        }

        // Third ready: start fires on every client, exactly once.
        net.clients[2].send_ready();
        let events = net.step_n(10, 10);
        for client_events in &events {
            let starts = client_events
                .iter()
                .filter(|e| matches!(e, ClientSessionEvent::StartScheduled { .. }))
                .count();
            assert_eq!(starts, 1);
        }
        assert_eq!(net.coordinator.state(), SessionState::Running);
    }

    #[test]
    fn test_three_clients_start_at_server_relative_time() {
        let mut net = TestNet::new(3, test_config(3));
        net.step_n(2, 10);
        for client in &mut net.clients {
            client.send_ready();
        }

        // Find the start broadcast and the simulation start per client.
        let mut scheduled_at = vec![None; 3];
        let mut started_at = vec![None; 3];
        let mut remaining = vec![0i64; 3];
        for _ in 0..400 {
            let now = net.clock.now_ms() + 10;
            for (i, events) in net.step(10).into_iter().enumerate() {
                for event in events {
                    match event {
                        ClientSessionEvent::StartScheduled { start_in_ms, players } => {
                            assert_eq!(players, vec![0, 1, 2]);
                            scheduled_at[i] = Some(now);
                            remaining[i] = start_in_ms;
                        }
                        ClientSessionEvent::Scheduler(SchedulerEvent::SimulationStarted) => {
                            started_at[i] = Some(now);
                        }
                        _ => {}
                    }
                }
            }
            if started_at.iter().all(|t| t.is_some()) {
                break;
            }
        }

        for i in 0..3 {
            let scheduled = scheduled_at[i].expect("start was scheduled");
            let started = started_at[i].expect("simulation started");
            assert_eq!(remaining[i], 3_000);
            // Start happens at handshake-relative T+3000, not receipt time.
            assert_eq!(started - scheduled, 3_000);
        }
        // All three started on the same instant.
        assert!(started_at.iter().all(|t| *t == started_at[0]));
    }

    #[test]
    fn test_command_reaches_every_client_identically() {
        let mut net = TestNet::new(3, test_config(3));

        // Every client records what its handler applied.
        let records: Vec<Arc<Mutex<Vec<(PlayerNum, Vec<u8>)>>>> =
            (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        for (client, record) in net.clients.iter_mut().zip(&records) {
            let record = record.clone();
            client
                .scheduler_mut()
                .register_command(7, move |payload: &[u8], player: PlayerNum| {
                    record.lock().unwrap().push((player, payload.to_vec()));
                    Ok(())
                });
        }

        net.step_n(2, 10);
        for client in &mut net.clients {
            client.send_ready();
        }
        // Through the countdown and into the session.
        net.step_n(320, 10);

        // Client with player number 1 submits command type 7.
        net.clients[1].submit(7, vec![1, 0, 1], None).unwrap();
        let events = net.step_n(150, 10);

        // Every client applied it exactly once, as player 1, in the same
        // turn number.
        let mut command_turns = Vec::new();
        for (i, client_events) in events.iter().enumerate() {
            let applied = records[i].lock().unwrap().clone();
            assert_eq!(applied, vec![(1, vec![1, 0, 1])]);
            let turn = client_events
                .iter()
                .find_map(|event| match event {
                    ClientSessionEvent::Scheduler(SchedulerEvent::TurnApplied {
                        number,
                        commands,
                    }) if *commands > 0 => Some(*number),
                    _ => None,
                })
                .expect("command turn applied");
            command_turns.push(turn);
        }
        assert!(command_turns.iter().all(|t| *t == command_turns[0]));
    }

    #[test]
    fn test_submission_order_is_preserved() {
        let mut net = TestNet::new(2, test_config(2));
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            net.clients[0]
                .scheduler_mut()
                .register_command(1, move |payload: &[u8], _: PlayerNum| {
                    order.lock().unwrap().push(payload[0]);
                    Ok(())
                });
        }
        net.clients[1]
            .scheduler_mut()
            .register_command(1, |_: &[u8], _: PlayerNum| Ok(()));

        net.step_n(2, 10);
        for client in &mut net.clients {
            client.send_ready();
        }
        net.step_n(320, 10);

        for value in 1..=5u8 {
            net.clients[1].submit(1, vec![value], None).unwrap();
        }
        net.step_n(150, 10);

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_disconnect_reconnect_replays_missed_turns() {
        let mut config = test_config(2);
        // Tight buffering so the disconnected client has little lookahead.
        config.start_delay_ms = 300;
        config.lockstep.simulation_delay_ms = 200;
        let mut net = TestNet::new(2, config);

        net.step_n(2, 10);
        for client in &mut net.clients {
            client.send_ready();
        }

        // Run until client 0 has applied turn 5.
        let mut applied: Vec<u32> = Vec::new();
        for _ in 0..300 {
            let events = net.step(50);
            applied.extend(applied_turns(&events[0]));
            if applied.contains(&5) {
                break;
            }
        }
        assert!(applied.contains(&5), "session never reached turn 5");

        // Sever client 0's link.
        let lost_id = net.client_ids[0];
        net.hub.disconnect(lost_id);
        let events = net.step_n(4, 50);
        assert!(events[0]
            .iter()
            .any(|e| matches!(e, ClientSessionEvent::ConnectionLost)));
        applied.extend(applied_turns(&events[0]));

        // Reconnect before long; the authority replays what was missed.
        let (transport, rx) = net.hub.reconnect(lost_id).unwrap();
        net.clients[0].reconnect(transport, rx);
        net.clients[0].send_ready();

        let events = net.step_n(100, 50);
        applied.extend(applied_turns(&events[0]));

        // No gap, no duplicate: the full applied sequence is 0,1,2,...
        let expected: Vec<u32> = (0..applied.len() as u32).collect();
        assert_eq!(applied, expected);
        // And the client genuinely progressed past the disconnect point.
        assert!(*applied.last().unwrap() > 8);
        assert!(net.clients[0].scheduler().connected());
    }

    #[test]
    fn test_handshake_timeout_aborts_for_everyone() {
        let mut net = TestNet::new(2, test_config(2));
        net.step_n(2, 10);
        net.clients[0].send_ready();
        net.step_n(2, 10);

        // Push past the ready window.
        net.clock.advance(31_000);
        let result = net.coordinator.tick();
        assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
        assert_eq!(net.coordinator.state(), SessionState::Aborted);

        for client in &mut net.clients {
            let events = client.tick();
            assert!(events.iter().any(|e| matches!(
                e,
                ClientSessionEvent::Ended { result } if result == HANDSHAKE_TIMEOUT_RESULT
            )));
        }
    }

    #[test]
    fn test_finish_flow_ends_session_with_results() {
        let mut net = TestNet::new(2, test_config(2));
        net.step_n(2, 10);
        for client in &mut net.clients {
            client.send_ready();
        }
        net.step_n(320, 10);

        net.clients[0].finish(b"p0".to_vec());
        net.step_n(10, 10);
        assert_eq!(net.coordinator.state(), SessionState::Running);

        net.clients[1].finish(b"p1".to_vec());
        let events = net.step_n(10, 10);

        assert_eq!(net.coordinator.state(), SessionState::Ended);
        assert!(events[0].iter().any(|e| matches!(
            e,
            ClientSessionEvent::Ended { result } if result == b"p0"
        )));
        assert!(events[1].iter().any(|e| matches!(
            e,
            ClientSessionEvent::Ended { result } if result == b"p1"
        )));
        for client in &net.clients {
            assert!(client.ended());
            assert!(client.synced());
        }
    }

    /// Duplicate command delivery (a retransmission racing its ack) must
    /// apply exactly once and be re-acknowledged each time.
    #[test]
    fn test_duplicate_command_applied_once() {
        let clock = ManualClock::new();
        let (hub, server, server_rx) = MemoryHub::new();
        let mut coordinator = SessionCoordinator::new(
            SESSION_ID,
            test_config(1),
            server,
            server_rx,
            Arc::new(clock.clone()),
        );
        let (raw, mut raw_rx) = hub.connect().unwrap();

        let drain = |rx: &mut EventReceiver| -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let TransportEvent::Message { payload, .. } = event {
                    messages.push(Message::decode(&payload).unwrap());
                }
            }
            messages
        };

        // Setup and ready by hand.
        coordinator.tick().unwrap();
        assert!(drain(&mut raw_rx)
            .iter()
            .any(|m| matches!(m, Message::ClientSetup(_))));
        raw.send(
            ChannelKind::Reliable,
            &Message::PlayerReady(crate::codec::PlayerReady { current_turn: 0 }).encode(),
        )
        .unwrap();
        clock.advance(10);
        coordinator.tick().unwrap();
        assert_eq!(coordinator.state(), SessionState::Running);
        drain(&mut raw_rx);

        // The same command record twice, as a retry would send it.
        let command = Message::Command(CommandRecord {
            type_id: 7,
            payload: vec![1, 0, 1],
            player: 0,
            seq: 4,
        })
        .encode();
        raw.send(ChannelKind::Reliable, &command).unwrap();
        raw.send(ChannelKind::Reliable, &command).unwrap();

        // Let the open turn close.
        clock.advance(3_200);
        coordinator.tick().unwrap();

        let messages = drain(&mut raw_rx);
        let acks = messages
            .iter()
            .filter(|m| matches!(m, Message::CommandAck { seqs } if seqs == &vec![4]))
            .count();
        assert_eq!(acks, 2);

        let delivered: usize = messages
            .iter()
            .map(|m| match m {
                Message::Turn(turn) => turn.commands.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(delivered, 1);
    }
}
