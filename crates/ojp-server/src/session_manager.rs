//! Session lifecycle: create, look up, expire, evict
//!
//! Sessions are keyed by session id in a concurrent map; a secondary index
//! on (client id, connection hash) lets a reconnecting client reuse its
//! live session within the idle window. `get` and `close` are linearizable
//! per session id: close removes the entry atomically before terminating,
//! so a concurrent get observes either the live session or absence, never
//! a half-closed entry.

use crate::backend::ConnectionHash;
use crate::error::ServerError;
use crate::session::Session;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    by_client: DashMap<(String, String), String>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            by_client: DashMap::new(),
            idle_timeout,
        }
    }

    /// Register a freshly created session.
    pub fn insert(&self, session: Arc<Session>) {
        self.by_client.insert(
            (
                session.client_id().to_string(),
                session.conn_hash().as_str().to_string(),
            ),
            session.session_id().to_string(),
        );
        self.sessions
            .insert(session.session_id().to_string(), session);
    }

    /// Look up a session by id. Closed or unknown sessions are not found.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, ServerError> {
        match self.sessions.get(session_id) {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            _ => Err(ServerError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Find a live session for a reconnecting client.
    pub fn lookup_existing(
        &self,
        client_id: &str,
        conn_hash: &ConnectionHash,
        is_xa: bool,
    ) -> Option<Arc<Session>> {
        let key = (client_id.to_string(), conn_hash.as_str().to_string());
        let session_id = self.by_client.get(&key)?.clone();
        let session = self.sessions.get(&session_id)?.clone();
        if session.is_closed() || session.is_xa() != is_xa {
            return None;
        }
        Some(session)
    }

    /// Close a session. Idempotent: closing an unknown id is a no-op.
    pub async fn close(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        self.by_client.remove(&(
            session.client_id().to_string(),
            session.conn_hash().as_str().to_string(),
        ));
        session.terminate().await;
        debug!(session_id, "session closed");
    }

    /// Sweep sessions idle longer than the configured timeout.
    pub async fn reap(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for session_id in expired {
            info!(session_id = %session_id, "evicting idle session");
            self.close(&session_id).await;
        }
        count
    }

    /// Terminate every session (shutdown path).
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            self.close(&session_id).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
