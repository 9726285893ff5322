//! In-Process Transport
//!
//! Deterministic loopback transport: every endpoint's sends are delivered
//! immediately, in order, into the peer's event queue. Used by tests and by
//! fully local sessions. A configurable per-client latency feeds the
//! client-side delay estimate, and unreliable-channel drops can be forced
//! to exercise loss tolerance.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::transport::{
    ChannelKind, ClientId, ClientTransport, EventReceiver, EventSender, ServerTransport,
    TransportError, TransportEvent, SERVER_CLIENT_ID,
};

struct ClientEndpoint {
    events: EventSender,
    latency_ms: i64,
    connected: bool,
}

struct HubInner {
    next_client: ClientId,
    server_events: EventSender,
    clients: BTreeMap<ClientId, ClientEndpoint>,
    drop_unreliable: bool,
}

/// Shared hub connecting one server endpoint with any number of clients.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    /// Create a hub along with its server endpoint and event stream.
    pub fn new() -> (Self, MemoryServerTransport, EventReceiver) {
        let (server_events, server_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(HubInner {
            next_client: SERVER_CLIENT_ID + 1,
            server_events,
            clients: BTreeMap::new(),
            drop_unreliable: false,
        }));
        let hub = Self { inner };
        let server = MemoryServerTransport {
            inner: hub.inner.clone(),
        };
        (hub, server, server_rx)
    }

    /// Connect a new client endpoint. Emits `Connected` on both sides.
    pub fn connect(&self) -> Result<(MemoryClientTransport, EventReceiver), TransportError> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if inner.next_client == ClientId::MAX {
            return Err(TransportError::ConnectionLimitReached);
        }
        let id = inner.next_client;
        inner.next_client += 1;

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Connected {
            client: SERVER_CLIENT_ID,
        });
        inner.clients.insert(
            id,
            ClientEndpoint {
                events,
                latency_ms: 0,
                connected: true,
            },
        );
        let _ = inner
            .server_events
            .send(TransportEvent::Connected { client: id });

        Ok((
            MemoryClientTransport {
                inner: self.inner.clone(),
                id,
            },
            rx,
        ))
    }

    /// Set the simulated one-way latency for a client.
    pub fn set_latency(&self, client: ClientId, latency_ms: i64) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(endpoint) = inner.clients.get_mut(&client) {
            endpoint.latency_ms = latency_ms;
        }
    }

    /// Drop all unreliable-channel traffic from now on.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.inner.lock().expect("hub lock poisoned").drop_unreliable = drop;
    }

    /// Sever a client's connection, notifying both sides. Equivalent to
    /// the network dropping the link.
    pub fn disconnect(&self, client: ClientId) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(endpoint) = inner.clients.get_mut(&client) {
            if endpoint.connected {
                endpoint.connected = false;
                let _ = endpoint.events.send(TransportEvent::Disconnected {
                    client: SERVER_CLIENT_ID,
                });
                let _ = inner
                    .server_events
                    .send(TransportEvent::Disconnected { client });
            }
        }
    }

    /// Reconnect a previously disconnected client under the same id,
    /// returning its fresh event stream.
    pub fn reconnect(
        &self,
        client: ClientId,
    ) -> Result<(MemoryClientTransport, EventReceiver), TransportError> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let endpoint = inner
            .clients
            .get_mut(&client)
            .ok_or(TransportError::UnknownClient(client))?;

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Connected {
            client: SERVER_CLIENT_ID,
        });
        endpoint.events = events;
        endpoint.connected = true;
        let _ = inner
            .server_events
            .send(TransportEvent::Connected { client });

        Ok((
            MemoryClientTransport {
                inner: self.inner.clone(),
                id: client,
            },
            rx,
        ))
    }
}

/// Server endpoint of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryServerTransport {
    inner: Arc<Mutex<HubInner>>,
}

impl ServerTransport for MemoryServerTransport {
    fn send_to(
        &self,
        client: ClientId,
        channel: ChannelKind,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        if channel == ChannelKind::Unreliable && inner.drop_unreliable {
            return Ok(());
        }
        let endpoint = inner
            .clients
            .get(&client)
            .ok_or(TransportError::UnknownClient(client))?;
        if !endpoint.connected {
            return Err(TransportError::NotConnected);
        }
        endpoint
            .events
            .send(TransportEvent::Message {
                sender: SERVER_CLIENT_ID,
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::ConnectionLost("client event queue closed".into()))
    }

    fn disconnect_client(&self, client: ClientId) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(endpoint) = inner.clients.get_mut(&client) {
            if endpoint.connected {
                endpoint.connected = false;
                let _ = endpoint.events.send(TransportEvent::Disconnected {
                    client: SERVER_CLIENT_ID,
                });
                let _ = inner
                    .server_events
                    .send(TransportEvent::Disconnected { client });
            }
        }
    }
}

/// Client endpoint of a [`MemoryHub`].
pub struct MemoryClientTransport {
    inner: Arc<Mutex<HubInner>>,
    id: ClientId,
}

impl MemoryClientTransport {
    /// The client id the hub assigned to this endpoint.
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl ClientTransport for MemoryClientTransport {
    fn send(&self, channel: ChannelKind, payload: &[u8]) -> Result<(), TransportError> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        if channel == ChannelKind::Unreliable && inner.drop_unreliable {
            return Ok(());
        }
        let endpoint = inner
            .clients
            .get(&self.id)
            .ok_or(TransportError::UnknownClient(self.id))?;
        if !endpoint.connected {
            return Err(TransportError::NotConnected);
        }
        inner
            .server_events
            .send(TransportEvent::Message {
                sender: self.id,
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::ConnectionLost("server event queue closed".into()))
    }

    fn disconnect(&self) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(endpoint) = inner.clients.get_mut(&self.id) {
            if endpoint.connected {
                endpoint.connected = false;
                let _ = endpoint.events.send(TransportEvent::Disconnected {
                    client: SERVER_CLIENT_ID,
                });
                let _ = inner
                    .server_events
                    .send(TransportEvent::Disconnected { client: self.id });
            }
        }
    }

    fn delay_ms(&self, _server_timestamp: i64) -> i64 {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner
            .clients
            .get(&self.id)
            .map(|endpoint| endpoint.latency_ms)
            .unwrap_or(0)
    }
}
