//! Session lifecycle state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle state of one relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error(String),
}

impl SessionState {
    /// `Closed` and `Error` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error(_))
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting | Closed | Error(_)) => true,
            (Connecting, Connected | Closing | Closed | Error(_)) => true,
            (Connected, Closing | Closed | Error(_)) => true,
            (Closing, Closed | Error(_)) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error(reason) => write!(f, "error({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Shared, observable state of one session.
///
/// The session task is the only writer; the client link and the session
/// table read it.
pub struct SessionStatus {
    state: watch::Sender<SessionState>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last input or output.
    last_activity_ms: AtomicU64,
}

impl SessionStatus {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Apply a transition. Illegal edges, including any edge out of a
    /// terminal state, are ignored and reported as `false`.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let applied = self.state.send_if_modified(|state| {
            if state.can_transition_to(&next) {
                from = Some(state.name());
                *state = next.clone();
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => debug!(from, to = %next, "session state"),
            None => debug!(current = %self.current(), rejected = %next, "illegal session transition ignored"),
        }
        applied
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolve once the session reaches `Closed` or `Error`.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            // Unreachable while `self` holds the sender.
            Err(_) => self.current(),
        };
        state
    }

    pub fn touch(&self) {
        let ms = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}
