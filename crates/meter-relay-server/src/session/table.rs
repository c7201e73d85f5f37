//! Registry of live sessions.
//!
//! Tracks every session between `open` and teardown, enforces the global and
//! per-user capacity limits, and fans out shutdown.

use super::state::{SessionState, SessionStatus};
use super::CloseReason;
use meter_relay_core::{RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// One live session as seen by the table.
pub struct SessionEntry {
    pub id: String,
    pub meter_id: String,
    pub user_id: String,
    pub status: Arc<SessionStatus>,
    pub cancel: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub meter_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Manages all live sessions.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_sessions: usize,
    max_sessions_per_user: usize,
}

impl SessionTable {
    /// `max_sessions_per_user == 0` means unlimited.
    pub fn new(max_sessions: usize, max_sessions_per_user: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_sessions_per_user,
        }
    }

    /// Register a session, or refuse it when a limit is reached.
    pub async fn insert(&self, entry: SessionEntry) -> RelayResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RelayError::Capacity(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        if self.max_sessions_per_user > 0 {
            let owned = sessions
                .values()
                .filter(|s| s.user_id == entry.user_id)
                .count();
            if owned >= self.max_sessions_per_user {
                return Err(RelayError::Capacity(format!(
                    "user {} already has {} sessions",
                    entry.user_id, owned
                )));
            }
        }
        info!(
            session_id = %entry.id,
            meter_id = %entry.meter_id,
            user_id = %entry.user_id,
            "session registered"
        );
        sessions.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "session removed");
        }
        removed
    }

    /// List all live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                meter_id: s.meter_id.clone(),
                user_id: s.user_id.clone(),
                state: s.status.current(),
                age_secs: s.status.age().as_secs(),
                idle_secs: s.status.idle().as_secs(),
            })
            .collect();
        infos.sort_by(|a, b| a.meter_id.cmp(&b.meter_id).then(a.id.cmp(&b.id)));
        infos
    }

    /// Get the number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Ask every live session to stop. Returns how many were signalled.
    pub async fn cancel_all(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.cancel.send_replace(Some(reason));
        }
        sessions.len()
    }
}
