//! Client-facing protocol frames.
//!
//! Frames travel as JSON text messages tagged by a `type` field:
//!
//! ```text
//! {"type":"connect","meterId":"M-001","port":9001,"userId":"u-7"}
//! {"type":"connected"}
//! {"type":"input","data":"ls\n"}
//! {"type":"output","data":"ls\n"}
//! {"type":"resize","rows":40,"cols":120}
//! {"type":"disconnect"}
//! {"type":"error","error":"meter M-001 is not online"}
//! ```

use serde::{Deserialize, Serialize};

/// One discrete protocol message exchanged over the client transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client asks to open a terminal on a meter.
    #[serde(rename_all = "camelCase")]
    Connect {
        meter_id: String,
        /// Port hint sent by the dashboard; the device directory is authoritative.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        user_id: String,
    },
    /// Handshake completed, data frames may flow.
    Connected,
    /// Keystrokes from the client terminal.
    Input { data: String },
    /// Bytes read from the device terminal.
    Output { data: String },
    /// Client terminal geometry changed.
    Resize { rows: u16, cols: u16 },
    /// Cooperative close request from the client.
    Disconnect,
    /// Terminal failure for the session.
    Error { error: String },
}

impl Frame {
    pub fn error(reason: impl Into<String>) -> Self {
        Frame::Error {
            error: reason.into(),
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "connect",
            Frame::Connected => "connected",
            Frame::Input { .. } => "input",
            Frame::Output { .. } => "output",
            Frame::Resize { .. } => "resize",
            Frame::Disconnect => "disconnect",
            Frame::Error { .. } => "error",
        }
    }
}
