//! Relay sessions: state machine, forwarding task and live-session table.

pub mod runner;
pub mod state;
pub mod table;

pub use runner::{SessionRunner, SessionSettings};
pub use state::{SessionState, SessionStatus};
pub use table::{SessionEntry, SessionInfo, SessionTable};

use meter_relay_core::{Frame, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Why a session was asked to stop without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `disconnect`.
    ClientDisconnect,
    /// The client transport went away.
    TransportClosed,
    /// The relay is shutting down.
    Shutdown,
}

/// Messages from the client link to a session task.
#[derive(Debug)]
pub enum SessionCommand {
    Frame(Frame),
    /// The link could not decode a client message.
    Fail(RelayError),
}

/// Messages to the per-connection writer, which owns the client sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Frame),
    /// Close the client transport after everything queued before it.
    Close,
}

/// The client link's view of a running session.
pub struct SessionHandle {
    pub id: String,
    pub meter_id: String,
    pub status: Arc<SessionStatus>,
    commands: mpsc::Sender<SessionCommand>,
    cancel: Arc<watch::Sender<Option<CloseReason>>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: String,
        meter_id: String,
        status: Arc<SessionStatus>,
        commands: mpsc::Sender<SessionCommand>,
        cancel: Arc<watch::Sender<Option<CloseReason>>>,
    ) -> Self {
        Self {
            id,
            meter_id,
            status,
            commands,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.current()
    }

    /// Queue a client frame. Returns `false` once the session task is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.commands.send(SessionCommand::Frame(frame)).await.is_ok()
    }

    pub async fn fail(&self, error: RelayError) -> bool {
        self.commands.send(SessionCommand::Fail(error)).await.is_ok()
    }

    /// Ask the session to stop; only the first reason sticks.
    pub fn cancel(&self, reason: CloseReason) {
        self.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Wait up to `limit` for the session to reach a terminal state.
    pub async fn wait_terminal(&self, limit: Duration) -> Option<SessionState> {
        tokio::time::timeout(limit, self.status.wait_terminal()).await.ok()
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub(crate) fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn first_cancel_reason_wins() {
        let (tx, _rx) = mpsc::channel(1);
        let (cancel, watch_rx) = watch::channel(None);
        let handle = SessionHandle::new(
            "s".into(),
            "M-001".into(),
            Arc::new(SessionStatus::new()),
            tx,
            Arc::new(cancel),
        );
        handle.cancel(CloseReason::ClientDisconnect);
        handle.cancel(CloseReason::Shutdown);
        assert_eq!(*watch_rx.borrow(), Some(CloseReason::ClientDisconnect));
    }
}
