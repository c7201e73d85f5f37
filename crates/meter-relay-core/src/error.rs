use thiserror::Error;

/// Typed failure from a device transport `open()` attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("device connection timed out")]
    Timeout,

    #[error("device refused connection: {0}")]
    Refused(String),
}

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("meter not found: {0}")]
    MeterNotFound(String),

    #[error("device directory is stale ({age_secs}s since last refresh)")]
    DirectoryStale { age_secs: u64 },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited: too many connect attempts")]
    RateLimited,

    #[error("capacity reached: {0}")]
    Capacity(String),

    #[error("device closed the stream")]
    DeviceClosed,

    #[error("device stopped draining input ({0} writes pending)")]
    DeviceStalled(usize),

    #[error("session idle timeout")]
    IdleTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short, stable reason carried in the client's `error` frame.
    pub fn client_reason(&self) -> String {
        match self {
            RelayError::Codec(_) => "malformed frame".into(),
            RelayError::ProtocolViolation(detail) => format!("protocol violation: {detail}"),
            RelayError::MeterNotFound(meter_id) => format!("meter {meter_id} is not online"),
            RelayError::DirectoryStale { .. } => "device directory unavailable".into(),
            RelayError::Connect(ConnectError::Unreachable(_)) => "device unreachable".into(),
            RelayError::Connect(ConnectError::Timeout) => "device connection timed out".into(),
            RelayError::Connect(ConnectError::Refused(_)) => "device refused the connection".into(),
            RelayError::Unauthorized(_) => "unauthorized".into(),
            RelayError::RateLimited => "too many connection attempts".into(),
            RelayError::Capacity(_) => "relay at capacity".into(),
            RelayError::DeviceClosed => "device closed the session".into(),
            RelayError::DeviceStalled(_) => "device is not accepting input".into(),
            RelayError::IdleTimeout => "session idle timeout".into(),
            RelayError::Io(_) | RelayError::Transport(_) => "device connection lost".into(),
            RelayError::Config(_) | RelayError::Inventory(_) => "internal relay error".into(),
        }
    }

    /// Whether the error invalidates the client transport itself.
    ///
    /// Fatal errors close the transport after the `error` frame; the others
    /// end the session but leave the transport open.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Codec(_)
                | RelayError::ProtocolViolation(_)
                | RelayError::DeviceClosed
                | RelayError::DeviceStalled(_)
                | RelayError::Io(_)
                | RelayError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
