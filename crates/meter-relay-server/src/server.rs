//! Relay server: wires the directory, gateway and WebSocket listener together
//! and coordinates startup and graceful shutdown.

use crate::auth::{AccessPolicy, UpgradeGuard};
use crate::config::ServerConfig;
use crate::directory::{refresh_once, spawn_refresh, DeviceDirectory, InventorySource};
use crate::gateway::{Gateway, GatewaySettings};
use crate::transport::websocket::{self, ConnectionOptions, ListenerOptions, WebSocketConnection};
use meter_relay_core::{DeviceConnector, RelayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// How often the maintenance task runs.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// A bound listener, ready to serve.
pub struct Listener {
    pub local_addr: SocketAddr,
    incoming: mpsc::Receiver<WebSocketConnection>,
}

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    directory: Arc<DeviceDirectory>,
    inventory: Option<Arc<dyn InventorySource>>,
    gateway: Arc<Gateway>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(
        config: ServerConfig,
        connector: Arc<dyn DeviceConnector>,
        inventory: Option<Arc<dyn InventorySource>>,
    ) -> Self {
        let directory = Arc::new(DeviceDirectory::new(config.max_age));
        let authorizer = Arc::new(AccessPolicy::new(config.allowed_users.clone()));
        let gateway = Arc::new(Gateway::new(
            directory.clone(),
            connector,
            authorizer,
            GatewaySettings::from_config(&config),
        ));
        Self {
            config,
            directory,
            inventory,
            gateway,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bind the client listener.
    pub async fn listen(&self, tls: Option<Arc<rustls::ServerConfig>>) -> RelayResult<Listener> {
        let bind_addr = SocketAddr::new(self.config.bind, self.config.port);
        let options = ListenerOptions {
            tls: tls.map(TlsAcceptor::from),
            guard: Arc::new(UpgradeGuard::new(
                self.config.auth_token.clone(),
                self.config.allowed_origins.clone(),
            )),
            max_frame_bytes: self.config.max_frame_bytes,
        };
        let (local_addr, incoming) = websocket::start_listener(bind_addr, options).await?;
        Ok(Listener {
            local_addr,
            incoming,
        })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run(
        self,
        tls: Option<Arc<rustls::ServerConfig>>,
        shutdown: impl Future<Output = ()>,
    ) -> RelayResult<()> {
        let listener = self.listen(tls).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections until `shutdown` resolves, then stop every session.
    pub async fn serve(
        self,
        listener: Listener,
        shutdown: impl Future<Output = ()>,
    ) -> RelayResult<()> {
        let Listener {
            local_addr,
            mut incoming,
        } = listener;

        self.start_directory().await;
        self.start_maintenance();

        let conn_options = ConnectionOptions {
            max_frame_bytes: self.config.max_frame_bytes,
            outbound_buffer: self.config.outbound_buffer,
            close_grace: self.config.teardown_grace,
        };

        info!(
            addr = %local_addr,
            tls = self.config.tls_enabled(),
            max_sessions = self.config.max_sessions,
            "meter-relay ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = incoming.recv() => match conn {
                    Some(conn) => {
                        let gateway = self.gateway.clone();
                        tokio::spawn(websocket::serve_connection(conn, gateway, conn_options));
                    }
                    None => {
                        warn!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        // Stop accepting, then stop background tasks and sessions.
        drop(incoming);
        let _ = self.shutdown_tx.send(());
        self.gateway.shutdown(self.config.teardown_grace * 2).await;
        info!("meter-relay stopped");
        Ok(())
    }

    async fn start_directory(&self) {
        let Some(source) = self.inventory.clone() else {
            warn!("no inventory source configured, every lookup will fail");
            return;
        };
        match refresh_once(&self.directory, source.as_ref()).await {
            Ok(_) => info!(
                source = %source.describe(),
                meters = self.directory.list_active_meters().len(),
                generation = self.directory.generation(),
                "device directory loaded"
            ),
            Err(e) => warn!(source = %source.describe(), error = %e, "initial directory load failed"),
        }
        spawn_refresh(
            self.directory.clone(),
            source,
            self.config.refresh_interval,
            self.shutdown_tx.subscribe(),
        );
    }

    /// Periodic rate-limiter GC and session report.
    fn start_maintenance(&self) {
        let gateway = self.gateway.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {}
                }
                gateway.gc_rate_limits().await;
                let sessions = gateway.list_sessions().await;
                info!(
                    sessions = sessions.len(),
                    meters = gateway.list_active_meters().len(),
                    "relay status"
                );
                for session in &sessions {
                    debug!(
                        session_id = %session.id,
                        meter_id = %session.meter_id,
                        user_id = %session.user_id,
                        state = %session.state,
                        age_secs = session.age_secs,
                        idle_secs = session.idle_secs,
                        "live session"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, ConfigOverrides};
    use crate::directory::StaticInventory;
    use crate::testing::{MockBehavior, MockConnector};
    use futures_util::{SinkExt, StreamExt};
    use meter_relay_core::{decode, Frame, MeterHandle};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> ServerConfig {
        let overrides = ConfigOverrides {
            bind: Some("127.0.0.1".parse().unwrap()),
            port: Some(0),
            ..Default::default()
        };
        ServerConfig::resolve(ConfigFile::default(), &overrides).unwrap()
    }

    async fn next_frame<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> Option<Frame>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame");
            match message {
                Some(Ok(Message::Text(text))) => return Some(decode(text.as_bytes()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let connector = Arc::new(MockConnector::new());
        connector.set("M-001", MockBehavior::Silent);
        let inventory: Arc<dyn InventorySource> = Arc::new(StaticInventory::new(vec![
            MeterHandle::new("M-001", 9001, 4242),
        ]));
        let server = RelayServer::new(test_config(), connector.clone(), Some(inventory));
        let gateway = server.gateway().clone();
        let listener = server.listen(None).await.unwrap();
        let addr = listener.local_addr;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async {
            let _ = stop_rx.await;
        }));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"type":"connect","meterId":"M-001","userId":"op-1"}"#.to_string().into(),
        ))
        .await
        .unwrap();
        assert_eq!(next_frame(&mut ws).await, Some(Frame::Connected));
        assert_eq!(gateway.session_count().await, 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(next_frame(&mut ws).await, Some(Frame::error("relay shutting down")));
        assert_eq!(next_frame(&mut ws).await, None);
        assert_eq!(gateway.session_count().await, 0);
        assert_eq!(connector.device("M-001").close_count(), 1);
    }
}
