//! One client transport's view of the gateway.
//!
//! A link carries at most one live session at a time. It routes decoded
//! client frames to that session, answers frames that arrive with no session,
//! and tells the transport when to stop reading.

use super::Gateway;
use crate::session::{CloseReason, Outbound, SessionHandle, SessionState};
use meter_relay_core::{Frame, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What the transport should do after handing a frame to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFlow {
    Continue,
    /// Stop reading; the writer has been told to close.
    Close,
}

pub struct ClientLink {
    gateway: Arc<Gateway>,
    outbound: mpsc::Sender<Outbound>,
    peer: String,
    session: Option<SessionHandle>,
    /// Set once a session ended fatally; everything after is discarded.
    draining: bool,
}

impl ClientLink {
    pub fn new(gateway: Arc<Gateway>, outbound: mpsc::Sender<Outbound>, peer: String) -> Self {
        Self {
            gateway,
            outbound,
            peer,
            session: None,
            draining: false,
        }
    }

    /// State of the current session, if any is attached.
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(SessionHandle::state)
    }

    pub async fn on_frame(&mut self, frame: Frame) -> LinkFlow {
        if self.reap() {
            return LinkFlow::Close;
        }

        let Some(session) = &self.session else {
            return self.on_idle_frame(frame).await;
        };

        if session.state() == SessionState::Closing {
            if let Frame::Connect { .. } = frame {
                let limit = self.gateway.settings().session.teardown_grace * 2;
                if session.wait_terminal(limit).await.is_none() {
                    warn!(peer = %self.peer, session_id = %session.id, "previous session did not finish");
                    return self.reject(RelayError::ProtocolViolation(
                        "connect while previous session is closing".into(),
                    ))
                    .await;
                }
                if self.reap() {
                    return LinkFlow::Close;
                }
                return self.on_idle_frame(frame).await;
            }
            debug!(peer = %self.peer, kind = frame.kind(), "discarding frame during teardown");
            return LinkFlow::Continue;
        }

        // Bypasses the command queue so it is never stuck behind input.
        if let Frame::Disconnect = frame {
            session.cancel(CloseReason::ClientDisconnect);
            return LinkFlow::Continue;
        }

        // Connect while a session is live is rejected by the session itself.
        if !session.send(frame).await {
            debug!(peer = %self.peer, session_id = %session.id, "session already finished");
        }
        LinkFlow::Continue
    }

    /// The transport delivered something that is not a valid frame.
    pub async fn on_decode_error(&mut self, error: RelayError) -> LinkFlow {
        if self.reap() {
            return LinkFlow::Close;
        }
        let Some(session) = &self.session else {
            warn!(peer = %self.peer, error = %error, "malformed frame without session");
            return self.reject(error).await;
        };
        if session.state() == SessionState::Closing {
            return LinkFlow::Continue;
        }
        // The session reports the error and closes the transport.
        if session.fail(error).await {
            return LinkFlow::Continue;
        }
        self.session = None;
        self.reject(RelayError::Codec("session gone".into())).await
    }

    /// The client transport is gone. Safe to call more than once.
    pub fn on_transport_closed(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(peer = %self.peer, session_id = %session.id, "transport closed, cancelling session");
            session.cancel(CloseReason::TransportClosed);
        }
    }

    async fn on_idle_frame(&mut self, frame: Frame) -> LinkFlow {
        match frame {
            Frame::Connect {
                meter_id,
                port,
                user_id,
            } => self.on_connect_frame(meter_id, port, user_id).await,
            // Late or repeated disconnects are harmless.
            Frame::Disconnect => LinkFlow::Continue,
            other => {
                self.reject(RelayError::ProtocolViolation(format!(
                    "expected connect, got {}",
                    other.kind()
                )))
                .await
            }
        }
    }

    async fn on_connect_frame(
        &mut self,
        meter_id: String,
        port: Option<u16>,
        user_id: String,
    ) -> LinkFlow {
        match self
            .gateway
            .open_session(meter_id.clone(), port, user_id.clone(), self.outbound.clone())
            .await
        {
            Ok(handle) => {
                debug!(peer = %self.peer, session_id = %handle.id, meter_id = %meter_id, "session started");
                self.session = Some(handle);
                LinkFlow::Continue
            }
            Err(e) => {
                warn!(
                    peer = %self.peer,
                    meter_id = %meter_id,
                    user_id = %user_id,
                    error = %e,
                    "connect refused"
                );
                self.reject(e).await
            }
        }
    }

    /// Answer with one `error` frame; fatal errors also close the transport.
    async fn reject(&mut self, error: RelayError) -> LinkFlow {
        let fatal = error.is_fatal();
        let _ = self
            .outbound
            .send(Outbound::Frame(Frame::error(error.client_reason())))
            .await;
        if fatal {
            self.draining = true;
            let _ = self.outbound.send(Outbound::Close).await;
            LinkFlow::Close
        } else {
            LinkFlow::Continue
        }
    }

    /// Forget a finished session. Returns `true` when the link is draining.
    fn reap(&mut self) -> bool {
        if self.draining {
            return true;
        }
        match self.session.as_ref().map(SessionHandle::state) {
            Some(SessionState::Closed) => self.session = None,
            Some(SessionState::Error(_)) => {
                self.session = None;
                self.draining = true;
            }
            _ => {}
        }
        self.draining
    }
}
