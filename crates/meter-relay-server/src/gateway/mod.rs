//! Session gateway: admits `connect` requests and owns the session table.
//!
//! The gateway checks authorization, connect rate and capacity, registers
//! the session and spawns its [`SessionRunner`]. Each client transport talks
//! to the gateway through a [`ClientLink`].

pub mod link;

pub use link::{ClientLink, LinkFlow};

use crate::auth::{Authorizer, RateLimiter};
use crate::config::ServerConfig;
use crate::directory::DeviceDirectory;
use crate::session::{
    generate_session_id, CloseReason, Outbound, SessionEntry, SessionHandle, SessionInfo,
    SessionRunner, SessionSettings, SessionState, SessionStatus, SessionTable,
};
use meter_relay_core::{DeviceConnector, MeterHandle, RelayError, RelayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Connect attempts are counted over this window.
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub session: SessionSettings,
    pub command_buffer: usize,
    pub max_sessions: usize,
    pub max_sessions_per_user: usize,
    /// 0 disables connect rate limiting.
    pub connect_attempts_per_minute: u32,
}

impl GatewaySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            session: SessionSettings {
                handshake_timeout: config.handshake_timeout,
                idle_timeout: config.idle_timeout,
                teardown_grace: config.teardown_grace,
                read_buffer_bytes: config.read_buffer_bytes,
                input_backlog: config.input_backlog,
            },
            command_buffer: config.command_buffer,
            max_sessions: config.max_sessions,
            max_sessions_per_user: config.max_sessions_per_user,
            connect_attempts_per_minute: config.connect_attempts_per_minute,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            command_buffer: 64,
            max_sessions: 256,
            max_sessions_per_user: 0,
            connect_attempts_per_minute: 0,
        }
    }
}

pub struct Gateway {
    directory: Arc<DeviceDirectory>,
    connector: Arc<dyn DeviceConnector>,
    authorizer: Arc<dyn Authorizer>,
    rate_limiter: Mutex<RateLimiter>,
    table: Arc<SessionTable>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        directory: Arc<DeviceDirectory>,
        connector: Arc<dyn DeviceConnector>,
        authorizer: Arc<dyn Authorizer>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            directory,
            connector,
            authorizer,
            rate_limiter: Mutex::new(RateLimiter::new(
                settings.connect_attempts_per_minute,
                RATE_WINDOW,
            )),
            table: Arc::new(SessionTable::new(
                settings.max_sessions,
                settings.max_sessions_per_user,
            )),
            settings,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Admit a `connect` and start its session in `Connecting`.
    ///
    /// Errors here mean no session was created; the directory lookup and
    /// device open happen inside the session task.
    pub async fn open_session(
        &self,
        meter_id: String,
        port_hint: Option<u16>,
        user_id: String,
        outbound: mpsc::Sender<Outbound>,
    ) -> RelayResult<SessionHandle> {
        self.authorizer
            .authorize(&user_id, &meter_id)
            .map_err(RelayError::Unauthorized)?;
        if !self.rate_limiter.lock().await.check_and_record(&user_id) {
            warn!(user_id = %user_id, "connect rate limit exceeded");
            return Err(RelayError::RateLimited);
        }

        let id = generate_session_id();
        let status = Arc::new(SessionStatus::new());
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let cancel = Arc::new(cancel_tx);
        let (commands_tx, commands_rx) = mpsc::channel(self.settings.command_buffer);

        status.transition(SessionState::Connecting);
        self.table
            .insert(SessionEntry {
                id: id.clone(),
                meter_id: meter_id.clone(),
                user_id: user_id.clone(),
                status: status.clone(),
                cancel: cancel.clone(),
            })
            .await?;

        let runner = SessionRunner {
            id: id.clone(),
            meter_id: meter_id.clone(),
            user_id,
            port_hint,
            status: status.clone(),
            commands: commands_rx,
            cancel: cancel_rx,
            outbound,
            directory: self.directory.clone(),
            connector: self.connector.clone(),
            table: self.table.clone(),
            settings: self.settings.session,
        };
        tokio::spawn(runner.run());

        Ok(SessionHandle::new(id, meter_id, status, commands_tx, cancel))
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.table.list().await
    }

    pub async fn session_count(&self) -> usize {
        self.table.count().await
    }

    pub fn list_active_meters(&self) -> Vec<MeterHandle> {
        self.directory.list_active_meters()
    }

    /// Drop rate-limit entries whose window has passed.
    pub async fn gc_rate_limits(&self) {
        let mut limiter = self.rate_limiter.lock().await;
        limiter.gc();
        debug!(tracked = limiter.tracked(), "rate limiter gc");
    }

    /// Stop every session and wait up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        let signalled = self.table.cancel_all(CloseReason::Shutdown).await;
        info!(sessions = signalled, "stopping sessions");
        let drained = tokio::time::timeout(grace, async {
            while self.table.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            let remaining = self.table.count().await;
            warn!(remaining, "sessions still running at shutdown");
        }
    }
}
