//! TCP bridge to a meter agent.
//!
//! The agent listens on its advertised port; the pid is used only to confirm
//! the agent process is still alive before dialing.

use meter_relay_core::{
    BoxFuture, ConnectError, DeviceConnector, DeviceReader, DeviceStream, DeviceWriter,
    MeterHandle,
};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Opens device streams by dialing `host:port`.
pub struct TcpDeviceConnector {
    host: String,
    verify_pid: bool,
}

impl TcpDeviceConnector {
    pub fn new(host: impl Into<String>, verify_pid: bool) -> Self {
        Self {
            host: host.into(),
            verify_pid,
        }
    }
}

impl DeviceConnector for TcpDeviceConnector {
    fn open<'a>(
        &'a self,
        handle: &'a MeterHandle,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<DeviceStream, ConnectError>> {
        Box::pin(async move {
            if self.verify_pid && !agent_alive(handle.pid) {
                return Err(ConnectError::Unreachable(format!(
                    "agent process {} is not running",
                    handle.pid
                )));
            }

            let addr = format!("{}:{}", self.host, handle.port);
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!(meter_id = %handle.meter_id, addr = %addr, "device refused connection");
                    return Err(ConnectError::Refused(format!("{addr}: {e}")));
                }
                Ok(Err(e)) => {
                    warn!(meter_id = %handle.meter_id, addr = %addr, error = %e, "device connect failed");
                    return Err(ConnectError::Unreachable(format!("{addr}: {e}")));
                }
                Err(_) => return Err(ConnectError::Timeout),
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "set_nodelay failed");
            }

            info!(meter_id = %handle.meter_id, addr = %addr, pid = handle.pid, "device stream opened");
            let (read_half, write_half) = stream.into_split();
            Ok(DeviceStream::new(
                Box::new(TcpDeviceReader { inner: read_half }),
                Box::new(TcpDeviceWriter {
                    inner: write_half,
                    meter_id: handle.meter_id.clone(),
                }),
            ))
        })
    }
}

struct TcpDeviceReader {
    inner: OwnedReadHalf,
}

impl DeviceReader for TcpDeviceReader {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move { self.inner.read(buf).await })
    }
}

struct TcpDeviceWriter {
    inner: OwnedWriteHalf,
    meter_id: String,
}

impl DeviceWriter for TcpDeviceWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move { self.inner.write_all(data).await })
    }

    fn resize(&mut self, rows: u16, cols: u16) -> BoxFuture<'_, io::Result<()>> {
        // A raw TCP bridge carries no out-of-band control channel.
        debug!(meter_id = %self.meter_id, rows, cols, "resize not supported by tcp bridge");
        Box::pin(async { Ok::<(), io::Error>(()) })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.inner.shutdown().await })
    }
}

#[cfg(target_os = "linux")]
fn agent_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn agent_alive(_pid: u32) -> bool {
    true
}
