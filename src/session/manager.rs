//! Session Manager
//!
//! Registry of concurrent sessions. Each session runs its own
//! single-threaded advancement loop; sessions are isolated from each
//! other and removed once closed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::session::coordinator::{SessionCoordinator, SessionId, SessionState};
use crate::transport::ServerTransport;

/// Manages all active sessions.
pub struct SessionManager<T: ServerTransport + 'static> {
    sessions: RwLock<BTreeMap<SessionId, Arc<RwLock<SessionCoordinator<T>>>>>,
}

impl<T: ServerTransport + 'static> SessionManager<T> {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a session built by the caller. Returns its id.
    pub async fn insert_session(&self, session: SessionCoordinator<T>) -> SessionId {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, Arc::new(RwLock::new(session)));
        id
    }

    /// Allocate a fresh session identifier.
    pub fn allocate_id() -> SessionId {
        uuid::Uuid::new_v4().into_bytes()
    }

    /// Get a session by id.
    pub async fn get_session(&self, id: &SessionId) -> Option<Arc<RwLock<SessionCoordinator<T>>>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Remove a session.
    pub async fn remove_session(&self, id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id);
    }

    /// Active session count.
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Remove sessions that have reached a terminal state.
    pub async fn cleanup(&self) {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();
        for (id, session) in sessions.iter() {
            let state = session.read().await.state();
            if matches!(state, SessionState::Closed | SessionState::Aborted) {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            sessions.remove(&id);
            info!(session = %hex::encode(&id[..4]), "session removed");
        }
    }

    /// Drive one session's advancement loop until it terminates. Intended
    /// to be spawned as a task per session.
    pub async fn run_session(
        session: Arc<RwLock<SessionCoordinator<T>>>,
        tick_interval: Duration,
        end_grace: Duration,
    ) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let mut guard = session.write().await;
            match guard.tick() {
                Ok(()) => {}
                Err(error) => {
                    warn!(%error, "session terminated");
                    guard.close();
                    break;
                }
            }
            match guard.state() {
                SessionState::Ended => {
                    // Give end notifications time to drain, then close.
                    drop(guard);
                    tokio::time::sleep(end_grace).await;
                    session.write().await.close();
                    break;
                }
                SessionState::Aborted | SessionState::Closed => break,
                _ => {}
            }
        }
    }
}

impl<T: ServerTransport + 'static> Default for SessionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::coordinator::SessionConfig;
    use crate::transport::memory::MemoryHub;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let manager = SessionManager::new();
        let (_hub, server, server_rx) = MemoryHub::new();
        let clock = Arc::new(ManualClock::new());
        let session = SessionCoordinator::new(
            SessionManager::<crate::transport::memory::MemoryServerTransport>::allocate_id(),
            SessionConfig::default(),
            server,
            server_rx,
            clock,
        );

        let id = manager.insert_session(session).await;
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get_session(&id).await.is_some());

        manager.remove_session(&id).await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_terminal_sessions() {
        let manager = SessionManager::new();
        let (_hub, server, server_rx) = MemoryHub::new();
        let clock = Arc::new(ManualClock::new());
        let mut session = SessionCoordinator::new(
            SessionManager::<crate::transport::memory::MemoryServerTransport>::allocate_id(),
            SessionConfig::default(),
            server,
            server_rx,
            clock,
        );
        session.close();

        manager.insert_session(session).await;
        assert_eq!(manager.session_count().await, 1);
        manager.cleanup().await;
        assert_eq!(manager.session_count().await, 0);
    }
}
