//! Lockstep Server
//!
//! Authoritative session server: accepts WebSocket clients, runs the
//! ready handshake and drives the canonical turn timeline for one
//! session. One process hosts one session, the way a dedicated match
//! server is deployed behind a matchmaker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep::clock::SystemClock;
use lockstep::session::{SessionConfig, SessionCoordinator, SessionManager};
use lockstep::transport::ws::{WsServerConfig, WsServerTransport};

/// On-disk server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerFileConfig {
    /// Bind address for the WebSocket listener.
    bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    max_connections: usize,
    /// Session parameters.
    session: SessionConfig,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 64,
            session: SessionConfig::default(),
        }
    }
}

fn load_config() -> anyhow::Result<ServerFileConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))
        }
        None => Ok(ServerFileConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = load_config()?;
    info!("lockstep server v{}", lockstep::VERSION);
    info!(
        "session: {} players, turn step {} ms, start delay {} ms",
        config.session.expected_players,
        config.session.lockstep.command_step_ms,
        config.session.start_delay_ms,
    );

    let (transport, events, handle) = WsServerTransport::new(WsServerConfig {
        bind_addr: config.bind_addr,
        max_connections: config.max_connections,
    });

    let clock = Arc::new(SystemClock::new());
    let session = SessionCoordinator::new(
        SessionManager::<WsServerTransport>::allocate_id(),
        config.session,
        transport,
        events,
        clock,
    );

    let manager: SessionManager<WsServerTransport> = SessionManager::new();
    let session_id = manager.insert_session(session).await;
    info!("session {} awaiting players", hex::encode(&session_id[..4]));

    let session = manager
        .get_session(&session_id)
        .await
        .expect("session registered above");
    let session_loop = tokio::spawn(SessionManager::run_session(
        session,
        Duration::from_millis(10),
        Duration::from_secs(2),
    ));

    let accept_loop = tokio::spawn(handle.run());

    tokio::select! {
        result = session_loop => {
            result.context("session loop panicked")?;
            info!("session finished, shutting down");
        }
        result = accept_loop => {
            result.context("accept loop panicked")?.context("listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    manager.cleanup().await;
    Ok(())
}
