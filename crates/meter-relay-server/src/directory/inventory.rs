//! Inventory sources that feed the device directory, and the refresh loop.

use super::DeviceDirectory;
use meter_relay_core::{BoxFuture, MeterHandle, RelayError, RelayResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Supplies the list of meters whose agents are currently reachable.
pub trait InventorySource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, RelayResult<Vec<MeterHandle>>>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// JSON file containing `[{"meterId": .., "port": .., "pid": ..}]`.
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl InventorySource for FileInventory {
    fn fetch(&self) -> BoxFuture<'_, RelayResult<Vec<MeterHandle>>> {
        Box::pin(async move {
            let data = tokio::fs::read(&self.path).await.map_err(|e| {
                RelayError::Inventory(format!("cannot read {}: {e}", self.path.display()))
            })?;
            parse_inventory(&data)
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// HTTP endpoint returning the same JSON document as [`FileInventory`].
pub struct HttpInventory {
    url: String,
    client: reqwest::Client,
}

impl HttpInventory {
    pub fn new(url: String, timeout: Duration) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Inventory(format!("http client: {e}")))?;
        Ok(Self { url, client })
    }
}

impl InventorySource for HttpInventory {
    fn fetch(&self) -> BoxFuture<'_, RelayResult<Vec<MeterHandle>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| RelayError::Inventory(format!("GET {}: {e}", self.url)))?;
            response
                .json::<Vec<MeterHandle>>()
                .await
                .map_err(|e| RelayError::Inventory(format!("bad inventory from {}: {e}", self.url)))
        })
    }

    fn describe(&self) -> String {
        format!("url:{}", self.url)
    }
}

/// Fixed inventory.
pub struct StaticInventory {
    meters: Vec<MeterHandle>,
}

impl StaticInventory {
    pub fn new(meters: Vec<MeterHandle>) -> Self {
        Self { meters }
    }
}

impl InventorySource for StaticInventory {
    fn fetch(&self) -> BoxFuture<'_, RelayResult<Vec<MeterHandle>>> {
        let meters = self.meters.clone();
        Box::pin(async move { Ok::<_, RelayError>(meters) })
    }

    fn describe(&self) -> String {
        format!("static:{}", self.meters.len())
    }
}

fn parse_inventory(data: &[u8]) -> RelayResult<Vec<MeterHandle>> {
    serde_json::from_slice(data).map_err(|e| RelayError::Inventory(format!("bad inventory: {e}")))
}

/// Fetch once and install the result. On failure the old snapshot stays.
pub async fn refresh_once(
    directory: &DeviceDirectory,
    source: &dyn InventorySource,
) -> RelayResult<u64> {
    let meters = source.fetch().await?;
    let count = meters.len();
    let generation = directory.replace(meters);
    debug!(generation, count, "directory refreshed");
    Ok(generation)
}

/// Poll `source` every `interval` until shutdown.
pub fn spawn_refresh(
    directory: Arc<DeviceDirectory>,
    source: Arc<dyn InventorySource>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(source = %source.describe(), interval_secs = interval.as_secs(), "directory refresh started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = refresh_once(&directory, source.as_ref()).await {
                        warn!(
                            error = %e,
                            age_secs = directory.age().as_secs(),
                            "directory refresh failed, keeping previous snapshot"
                        );
                    }
                }
            }
        }
        debug!("directory refresh stopped");
    })
}
