//! WebSocket Transport
//!
//! Async WebSocket implementation of the transport traits, one endpoint per
//! process role: [`WsServerTransport`] accepts many client connections and
//! assigns each a [`ClientId`]; [`WsClientTransport`] holds one connection
//! to the authority and maintains a latency estimate from ping/pong probes.
//!
//! WebSocket rides on TCP, so both channels deliver reliably here; the
//! unreliable channel keeps its weaker contract for callers but happens to
//! never drop. Latency probes still travel on it so that a datagram
//! transport can be substituted without touching callers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::codec::{msg_type, Message};
use crate::transport::{
    ChannelKind, ClientId, ClientTransport, EventReceiver, EventSender, ServerTransport,
    TransportError, TransportEvent, SERVER_CLIENT_ID,
};

/// WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 64,
        }
    }
}

enum Outbound {
    Payload(Vec<u8>),
    Close,
}

struct WsServerState {
    events: EventSender,
    clients: RwLock<BTreeMap<ClientId, mpsc::UnboundedSender<Outbound>>>,
    next_client: Mutex<ClientId>,
    max_connections: usize,
    shutdown: broadcast::Sender<()>,
}

impl WsServerState {
    fn allocate_client_id(&self) -> Option<ClientId> {
        let clients = self.clients.read().expect("client map poisoned");
        if clients.len() >= self.max_connections {
            return None;
        }
        let mut next = self.next_client.lock().expect("id counter poisoned");
        // Smallest free id above the reserved authority id.
        for _ in 0..ClientId::MAX {
            let candidate = *next;
            *next = if *next == ClientId::MAX {
                SERVER_CLIENT_ID + 1
            } else {
                *next + 1
            };
            if !clients.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Authority-side WebSocket transport.
pub struct WsServerTransport {
    state: Arc<WsServerState>,
}

impl WsServerTransport {
    /// Create the transport and its event stream.
    pub fn new(config: WsServerConfig) -> (Self, EventReceiver, WsServerHandle) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let state = Arc::new(WsServerState {
            events,
            clients: RwLock::new(BTreeMap::new()),
            next_client: Mutex::new(SERVER_CLIENT_ID + 1),
            max_connections: config.max_connections,
            shutdown,
        });
        let handle = WsServerHandle {
            state: state.clone(),
            config,
        };
        (Self { state }, rx, handle)
    }
}

/// Runs the accept loop for a [`WsServerTransport`].
pub struct WsServerHandle {
    state: Arc<WsServerState>,
    config: WsServerConfig,
}

impl WsServerHandle {
    /// Accept connections until shutdown. Intended to run in its own task.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("lockstep transport listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.state.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            Self::handle_connection(self.state.clone(), stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("transport shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signal the accept loop and all connection tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.state.shutdown.send(());
    }

    fn handle_connection(state: Arc<WsServerState>, stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let client_id = match state.allocate_client_id() {
                Some(id) => id,
                None => {
                    warn!("connection limit reached, rejecting {}", addr);
                    let _ = state
                        .events
                        .send(TransportEvent::Error(TransportError::ConnectionLimitReached));
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
            state
                .clients
                .write()
                .expect("client map poisoned")
                .insert(client_id, out_tx);

            debug!("client {} connected from {}", client_id, addr);
            let _ = state
                .events
                .send(TransportEvent::Connected { client: client_id });

            let mut shutdown_rx = state.shutdown.subscribe();
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => {
                        match outbound {
                            Some(Outbound::Payload(payload)) => {
                                if let Err(e) = ws_sender
                                    .send(tokio_tungstenite::tungstenite::Message::Binary(payload))
                                    .await
                                {
                                    let _ = state.events.send(TransportEvent::Error(
                                        TransportError::SendFailed(e.to_string()),
                                    ));
                                    break;
                                }
                            }
                            Some(Outbound::Close) | None => break,
                        }
                    }
                    incoming = ws_receiver.next() => {
                        match incoming {
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(payload))) => {
                                let _ = state.events.send(TransportEvent::Message {
                                    sender: client_id,
                                    payload,
                                });
                            }
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                                break;
                            }
                            Some(Ok(_)) => {
                                // Text/ping/pong frames are not part of the protocol.
                            }
                            Some(Err(e)) => {
                                let _ = state.events.send(TransportEvent::Error(
                                    TransportError::ConnectionLost(e.to_string()),
                                ));
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = ws_sender
                            .send(tokio_tungstenite::tungstenite::Message::Close(None))
                            .await;
                        break;
                    }
                }
            }

            state
                .clients
                .write()
                .expect("client map poisoned")
                .remove(&client_id);
            let _ = state
                .events
                .send(TransportEvent::Disconnected { client: client_id });
            debug!("client {} from {} cleaned up", client_id, addr);
        });
    }
}

impl ServerTransport for WsServerTransport {
    fn send_to(
        &self,
        client: ClientId,
        _channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let clients = self.state.clients.read().expect("client map poisoned");
        let sender = clients
            .get(&client)
            .ok_or(TransportError::UnknownClient(client))?;
        sender
            .send(Outbound::Payload(payload.to_vec()))
            .map_err(|_| TransportError::ConnectionLost("connection task gone".into()))
    }

    fn disconnect_client(&self, client: ClientId) {
        let clients = self.state.clients.read().expect("client map poisoned");
        if let Some(sender) = clients.get(&client) {
            let _ = sender.send(Outbound::Close);
        }
    }
}

/// Client-side WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// Interval between latency probes.
    pub ping_interval: Duration,
}

impl WsClientConfig {
    /// Config with the default two-second probe cadence.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(2),
        }
    }
}

struct LatencyEstimate {
    /// server_clock - local_clock, in milliseconds.
    offset_ms: AtomicI64,
    rtt_ms: AtomicI64,
    has_estimate: AtomicBool,
}

/// Client-side WebSocket transport.
pub struct WsClientTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    latency: Arc<LatencyEstimate>,
    origin: Instant,
}

impl WsClientTransport {
    /// Connect to the authority, returning the transport and event stream.
    pub async fn connect(config: WsClientConfig) -> Result<(Self, EventReceiver), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&config.url)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (events, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let connected = Arc::new(AtomicBool::new(true));
        let latency = Arc::new(LatencyEstimate {
            offset_ms: AtomicI64::new(0),
            rtt_ms: AtomicI64::new(0),
            has_estimate: AtomicBool::new(false),
        });
        let origin = Instant::now();

        let _ = events.send(TransportEvent::Connected {
            client: SERVER_CLIENT_ID,
        });

        // Writer task.
        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Payload(payload) => {
                        if ws_sender
                            .send(tokio_tungstenite::tungstenite::Message::Binary(payload))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_sender
                            .send(tokio_tungstenite::tungstenite::Message::Close(None))
                            .await;
                        break;
                    }
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        // Reader task: pong probes update the latency estimate, everything
        // else is handed to the owner.
        let reader_events = events.clone();
        let reader_connected = connected.clone();
        let reader_latency = latency.clone();
        tokio::spawn(async move {
            while let Some(incoming) = ws_receiver.next().await {
                match incoming {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(payload)) => {
                        if payload.first() == Some(&msg_type::PONG) {
                            if let Ok(Message::Pong {
                                timestamp,
                                server_time,
                            }) = Message::decode(&payload)
                            {
                                let local_now = origin.elapsed().as_millis() as i64;
                                let rtt = (local_now - timestamp).max(0);
                                let offset = server_time + rtt / 2 - local_now;
                                reader_latency.rtt_ms.store(rtt, Ordering::SeqCst);
                                reader_latency.offset_ms.store(offset, Ordering::SeqCst);
                                reader_latency.has_estimate.store(true, Ordering::SeqCst);
                            }
                            continue;
                        }
                        let _ = reader_events.send(TransportEvent::Message {
                            sender: SERVER_CLIENT_ID,
                            payload,
                        });
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_events.send(TransportEvent::Error(
                            TransportError::ConnectionLost(e.to_string()),
                        ));
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = reader_events.send(TransportEvent::Disconnected {
                client: SERVER_CLIENT_ID,
            });
        });

        // Latency probe task.
        let ping_tx = out_tx.clone();
        let ping_connected = connected.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !ping_connected.load(Ordering::SeqCst) {
                    break;
                }
                let timestamp = origin.elapsed().as_millis() as i64;
                let payload = Message::Ping { timestamp }.encode();
                if ping_tx.send(Outbound::Payload(payload)).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                outbound: out_tx,
                connected,
                latency,
                origin,
            },
            rx,
        ))
    }

    /// Latest round-trip estimate, if a probe has completed.
    pub fn rtt_ms(&self) -> Option<i64> {
        if self.latency.has_estimate.load(Ordering::SeqCst) {
            Some(self.latency.rtt_ms.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

impl ClientTransport for WsClientTransport {
    fn send(&self, _channel: ChannelKind, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(Outbound::Payload(payload.to_vec()))
            .map_err(|_| TransportError::NotConnected)
    }

    fn disconnect(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn delay_ms(&self, server_timestamp: i64) -> i64 {
        if !self.latency.has_estimate.load(Ordering::SeqCst) {
            return 0;
        }
        let local_now = self.origin.elapsed().as_millis() as i64;
        let offset = self.latency.offset_ms.load(Ordering::SeqCst);
        (local_now + offset - server_timestamp).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_client_server_roundtrip() {
        let config = WsServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        // Bind on an ephemeral port by hand so the test knows the address.
        let listener = TcpListener::bind(config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = WsServerConfig {
            bind_addr: addr,
            ..Default::default()
        };
        let (server, mut server_rx, handle) = WsServerTransport::new(config);
        let accept = tokio::spawn(handle.run());

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (client, mut client_rx) =
            WsClientTransport::connect(WsClientConfig::new(format!("ws://{}", addr)))
                .await
                .unwrap();

        assert!(matches!(
            next_event(&mut client_rx).await,
            TransportEvent::Connected { .. }
        ));
        let client_id = match next_event(&mut server_rx).await {
            TransportEvent::Connected { client } => client,
            other => panic!("expected connect, got {:?}", other),
        };

        client.send(ChannelKind::Reliable, &[0x7F, 1, 2]).unwrap();
        match next_event(&mut server_rx).await {
            TransportEvent::Message { sender, payload } => {
                assert_eq!(sender, client_id);
                assert_eq!(payload, vec![0x7F, 1, 2]);
            }
            other => panic!("expected message, got {:?}", other),
        }

        server
            .send_to(client_id, ChannelKind::Reliable, &[9, 9])
            .unwrap();
        match next_event(&mut client_rx).await {
            TransportEvent::Message { payload, .. } => assert_eq!(payload, vec![9, 9]),
            other => panic!("expected message, got {:?}", other),
        }

        client.disconnect();
        accept.abort();
    }
}
