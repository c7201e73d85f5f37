//! Local shell in a pseudo-terminal, standing in for a meter on a bench.
//!
//! Each `open()` spawns a fresh shell with `METER_ID`, `METER_PORT` and
//! `METER_PID` exported, so scripts can emulate a particular device.

use meter_relay_core::{
    BoxFuture, ConnectError, DeviceConnector, DeviceReader, DeviceStream, DeviceWriter,
    MeterHandle,
};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// Opens device streams backed by a local PTY shell.
pub struct LocalPtyConnector {
    shell: Option<String>,
}

impl LocalPtyConnector {
    pub fn new(shell: Option<String>) -> Self {
        Self { shell }
    }
}

impl DeviceConnector for LocalPtyConnector {
    fn open<'a>(
        &'a self,
        handle: &'a MeterHandle,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<DeviceStream, ConnectError>> {
        let shell = self
            .shell
            .clone()
            .unwrap_or_else(|| std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()));
        let handle = handle.clone();
        Box::pin(async move {
            // A spawn that finishes after the timeout drops its stream, which
            // kills the shell.
            let spawn = tokio::task::spawn_blocking(move || spawn_pty(&shell, &handle));
            match tokio::time::timeout(timeout, spawn).await {
                Ok(Ok(result)) => result.map(|(reader, writer)| {
                    DeviceStream::new(Box::new(reader), Box::new(writer))
                }),
                Ok(Err(e)) => Err(ConnectError::Unreachable(format!("pty spawn task failed: {e}"))),
                Err(_) => Err(ConnectError::Timeout),
            }
        })
    }
}

fn spawn_pty(shell: &str, handle: &MeterHandle) -> Result<(PtyReader, PtyWriter), ConnectError> {
    let size = PtySize {
        rows: INITIAL_ROWS,
        cols: INITIAL_COLS,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| ConnectError::Unreachable(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(shell);
    cmd.env("TERM", "xterm-256color");
    cmd.env("METER_ID", &handle.meter_id);
    cmd.env("METER_PORT", handle.port.to_string());
    cmd.env("METER_PID", handle.pid.to_string());

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ConnectError::Refused(format!("failed to spawn {shell}: {e}")))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ConnectError::Unreachable(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ConnectError::Unreachable(format!("failed to take PTY writer: {e}")))?;

    // portable-pty readers are blocking; pump them from a dedicated thread.
    let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>(16);
    std::thread::Builder::new()
        .name(format!("pty-{}", handle.meter_id))
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        })
        .map_err(|e| ConnectError::Unreachable(format!("failed to start PTY reader: {e}")))?;

    info!(meter_id = %handle.meter_id, shell, "local PTY spawned");
    Ok((
        PtyReader {
            rx,
            leftover: Vec::new(),
        },
        PtyWriter {
            writer: Arc::new(Mutex::new(writer)),
            master: pair.master,
            child: Some(child),
        },
    ))
}

struct PtyReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    leftover: Vec<u8>,
}

impl DeviceReader for PtyReader {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.leftover.is_empty() {
                match self.rx.recv().await {
                    Some(Ok(chunk)) => self.leftover = chunk,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(0),
                }
            }
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Ok(n)
        })
    }
}

struct PtyWriter {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl DeviceWriter for PtyWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut writer = writer
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "PTY writer poisoned"))?;
                writer.write_all(&data)?;
                writer.flush()
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("join error: {e}")))?
        })
    }

    fn resize(&mut self, rows: u16, cols: u16) -> BoxFuture<'_, io::Result<()>> {
        let result = self
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("PTY resize failed: {e}")));
        if result.is_ok() {
            debug!(rows, cols, "PTY resized");
        }
        Box::pin(async move { result })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        let child = self.child.take();
        Box::pin(async move {
            if let Some(child) = child {
                tokio::task::spawn_blocking(move || kill_and_reap(child));
            }
            Ok(())
        })
    }
}

impl Drop for PtyWriter {
    fn drop(&mut self) {
        // Streams dropped without close(): abandoned opens, aborted sessions.
        if let Some(child) = self.child.take() {
            debug!("PTY stream dropped without close, killing shell");
            let _ = std::thread::Builder::new()
                .name("pty-reap".into())
                .spawn(move || kill_and_reap(child));
        }
    }
}

fn kill_and_reap(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    match child.wait() {
        Ok(status) => debug!(code = status.exit_code(), "PTY child exited"),
        Err(e) => debug!(error = %e, "PTY child wait failed"),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn dropped_stream_kills_shell() {
        let handle = MeterHandle::new("M-001", 9001, 4242);
        let (_reader, writer) = tokio::task::spawn_blocking(move || spawn_pty("/bin/sh", &handle))
            .await
            .unwrap()
            .unwrap();
        let pid = writer
            .child
            .as_ref()
            .and_then(|child| child.process_id())
            .unwrap();
        let proc_dir = format!("/proc/{pid}");
        assert!(Path::new(&proc_dir).exists());

        drop(writer);
        crate::testing::eventually(|| !Path::new(&proc_dir).exists()).await;
    }
}
