//! Device transport connectors.

pub mod pty;
pub mod tcp;

pub use pty::LocalPtyConnector;
pub use tcp::TcpDeviceConnector;
