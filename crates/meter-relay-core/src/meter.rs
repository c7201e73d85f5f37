use serde::{Deserialize, Serialize};

/// A meter whose local agent was confirmed reachable by the inventory.
///
/// `port` and `pid` identify the agent's pseudo-terminal process on the
/// device side; how they map to a byte stream is up to the connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterHandle {
    pub meter_id: String,
    pub port: u16,
    pub pid: u32,
}

impl MeterHandle {
    pub fn new(meter_id: impl Into<String>, port: u16, pid: u32) -> Self {
        Self {
            meter_id: meter_id.into(),
            port,
            pid,
        }
    }
}
