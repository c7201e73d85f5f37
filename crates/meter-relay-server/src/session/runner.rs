//! The per-session task: handshake, bidirectional forwarding, teardown.
//!
//! One runner owns one session from `Connecting` until its terminal state.
//! Client frames arrive on the command channel. Device I/O runs in two
//! helper tasks, one per direction, so the runner itself never waits on the
//! device and always sees `disconnect`, transport loss and the idle timer.
//! Every exit path goes through [`SessionRunner::finish`], which sends at
//! most one `error` frame, sets the terminal state and removes the session
//! from the table.

use super::state::{SessionState, SessionStatus};
use super::table::SessionTable;
use super::{CloseReason, Outbound, SessionCommand};
use crate::directory::DeviceDirectory;
use meter_relay_core::{
    ConnectError, DeviceConnector, DeviceReader, DeviceStream, DeviceWriter, Frame, RelayError,
    Utf8Accumulator,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timing and buffer knobs for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Bound on `close()` of the device stream and on final frame delivery.
    pub teardown_grace: Duration,
    pub read_buffer_bytes: usize,
    /// Input and resize requests queued behind a slow device before the
    /// session is failed.
    pub input_backlog: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            teardown_grace: Duration::from_secs(2),
            read_buffer_bytes: 8192,
            input_backlog: 1024,
        }
    }
}

/// How the session ended.
#[derive(Debug)]
enum Outcome {
    Closed(CloseReason),
    Failed(RelayError),
}

/// Client request bound for the device, applied in arrival order.
#[derive(Debug)]
enum DeviceOp {
    Write(String),
    Resize { rows: u16, cols: u16 },
}

type SharedWriter = Arc<Mutex<Box<dyn DeviceWriter>>>;

/// Why the output pump stopped.
#[derive(Debug)]
enum PumpExit {
    Eof,
    ClientGone,
    Failed(io::Error),
}

pub struct SessionRunner {
    pub id: String,
    pub meter_id: String,
    pub user_id: String,
    pub port_hint: Option<u16>,
    pub status: Arc<SessionStatus>,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub cancel: watch::Receiver<Option<CloseReason>>,
    pub outbound: mpsc::Sender<Outbound>,
    pub directory: Arc<DeviceDirectory>,
    pub connector: Arc<dyn DeviceConnector>,
    pub table: Arc<SessionTable>,
    pub settings: SessionSettings,
}

impl SessionRunner {
    pub async fn run(mut self) {
        let outcome = match self.handshake().await {
            Ok(stream) => self.forward(stream).await,
            Err(outcome) => outcome,
        };
        self.finish(outcome).await;
    }

    /// Resolve the meter and open the device stream, bounded by the
    /// handshake timeout. A client `disconnect` aborts the open.
    async fn handshake(&mut self) -> Result<DeviceStream, Outcome> {
        let handle = self.directory.lookup(&self.meter_id).map_err(Outcome::Failed)?;
        if let Some(hint) = self.port_hint.filter(|hint| *hint != handle.port) {
            warn!(
                session_id = %self.id,
                meter_id = %self.meter_id,
                hint,
                port = handle.port,
                "client port hint disagrees with directory, using directory"
            );
        }
        debug!(
            session_id = %self.id,
            meter_id = %handle.meter_id,
            port = handle.port,
            pid = handle.pid,
            "opening device stream"
        );

        let limit = self.settings.handshake_timeout;
        let connector = self.connector.clone();
        let open = tokio::time::timeout(limit, connector.open(&handle, limit));

        tokio::select! {
            biased;
            reason = cancelled(&mut self.cancel) => Err(Outcome::Closed(reason)),
            command = self.commands.recv() => Err(match command {
                Some(SessionCommand::Frame(Frame::Disconnect)) => {
                    Outcome::Closed(CloseReason::ClientDisconnect)
                }
                Some(SessionCommand::Frame(frame)) => Outcome::Failed(
                    RelayError::ProtocolViolation(format!("{} before connected", frame.kind())),
                ),
                Some(SessionCommand::Fail(e)) => Outcome::Failed(e),
                None => Outcome::Closed(CloseReason::TransportClosed),
            }),
            result = open => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(Outcome::Failed(e.into())),
                Err(_) => Err(Outcome::Failed(ConnectError::Timeout.into())),
            },
        }
    }

    /// Connected phase. Always closes the device stream exactly once.
    async fn forward(&mut self, stream: DeviceStream) -> Outcome {
        let (reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        self.status.transition(SessionState::Connected);
        self.status.touch();

        let outcome = if self.outbound.send(Outbound::Frame(Frame::Connected)).await.is_err() {
            Outcome::Closed(CloseReason::TransportClosed)
        } else {
            info!(
                session_id = %self.id,
                meter_id = %self.meter_id,
                user_id = %self.user_id,
                "session connected"
            );
            let (input_tx, input_rx) = mpsc::channel(self.settings.input_backlog);
            let mut sink = tokio::spawn(drain_input(writer.clone(), input_rx));
            let mut pump = tokio::spawn(pump_output(
                reader,
                self.outbound.clone(),
                self.status.clone(),
                self.settings.read_buffer_bytes,
            ));
            let outcome = self.relay(&input_tx, &mut pump, &mut sink).await;
            pump.abort();
            // Drops a write the device never finished; the lock comes back
            // with it.
            sink.abort();
            outcome
        };

        self.status.transition(SessionState::Closing);
        let close = async { writer.lock().await.close().await };
        match tokio::time::timeout(self.settings.teardown_grace, close).await {
            Ok(Ok(())) => debug!(session_id = %self.id, "device stream closed"),
            Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "device close failed"),
            Err(_) => warn!(session_id = %self.id, "device close timed out"),
        }
        outcome
    }

    async fn relay(
        &mut self,
        input: &mpsc::Sender<DeviceOp>,
        pump: &mut JoinHandle<PumpExit>,
        sink: &mut JoinHandle<io::Result<()>>,
    ) -> Outcome {
        let idle_limit = self.settings.idle_timeout;
        let idle_timer = tokio::time::sleep(idle_limit.unwrap_or(Duration::from_secs(3600)));
        tokio::pin!(idle_timer);

        loop {
            tokio::select! {
                biased;
                reason = cancelled(&mut self.cancel) => return Outcome::Closed(reason),
                exit = &mut *pump => return match exit {
                    Ok(PumpExit::Eof) => Outcome::Failed(RelayError::DeviceClosed),
                    Ok(PumpExit::ClientGone) => Outcome::Closed(CloseReason::TransportClosed),
                    Ok(PumpExit::Failed(e)) => Outcome::Failed(RelayError::Io(e)),
                    Err(e) => Outcome::Failed(RelayError::Transport(format!("output pump: {e}"))),
                },
                result = &mut *sink => return match result {
                    Ok(Ok(())) => Outcome::Failed(RelayError::DeviceClosed),
                    Ok(Err(e)) => Outcome::Failed(RelayError::Io(e)),
                    Err(e) => Outcome::Failed(RelayError::Transport(format!("input sink: {e}"))),
                },
                command = self.commands.recv() => match command {
                    None => return Outcome::Closed(CloseReason::TransportClosed),
                    Some(SessionCommand::Fail(e)) => return Outcome::Failed(e),
                    Some(SessionCommand::Frame(frame)) => {
                        if let Some(outcome) = self.apply(frame, input) {
                            return outcome;
                        }
                    }
                },
                () = &mut idle_timer, if idle_limit.is_some() => {
                    let limit = idle_limit.unwrap_or_default();
                    let idle = self.status.idle();
                    if idle >= limit {
                        return Outcome::Failed(RelayError::IdleTimeout);
                    }
                    idle_timer.as_mut().reset(Instant::now() + (limit - idle));
                }
            }
        }
    }

    /// Apply one client frame while connected. `Some` ends the session.
    fn apply(&self, frame: Frame, input: &mpsc::Sender<DeviceOp>) -> Option<Outcome> {
        let op = match frame {
            Frame::Input { data } => {
                self.status.touch();
                DeviceOp::Write(data)
            }
            Frame::Resize { rows, cols } if rows == 0 || cols == 0 => {
                debug!(session_id = %self.id, rows, cols, "ignoring empty resize");
                return None;
            }
            Frame::Resize { rows, cols } => DeviceOp::Resize { rows, cols },
            Frame::Disconnect => return Some(Outcome::Closed(CloseReason::ClientDisconnect)),
            other => {
                return Some(Outcome::Failed(RelayError::ProtocolViolation(format!(
                    "unexpected {} frame while connected",
                    other.kind()
                ))))
            }
        };
        match input.try_send(op) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => Some(Outcome::Failed(RelayError::DeviceStalled(
                self.settings.input_backlog,
            ))),
            // The sink exited; `relay` picks up its result next.
            Err(TrySendError::Closed(_)) => None,
        }
    }

    /// Report the outcome to the client, enter the terminal state and leave
    /// the table.
    async fn finish(self, outcome: Outcome) {
        // A client that reacts to the final frame must already see teardown.
        if self.status.current() != SessionState::Closing {
            self.status.transition(SessionState::Closing);
        }
        let terminal = match outcome {
            Outcome::Closed(reason) => {
                info!(session_id = %self.id, meter_id = %self.meter_id, ?reason, "session closed");
                if reason == CloseReason::Shutdown {
                    self.notify(Frame::error("relay shutting down"), true).await;
                }
                SessionState::Closed
            }
            Outcome::Failed(err) => {
                let reason = err.client_reason();
                let fatal = err.is_fatal();
                warn!(
                    session_id = %self.id,
                    meter_id = %self.meter_id,
                    error = %err,
                    fatal,
                    "session ended with error"
                );
                self.notify(Frame::error(reason.clone()), fatal).await;
                if fatal {
                    SessionState::Error(reason)
                } else {
                    SessionState::Closed
                }
            }
        };
        self.status.transition(terminal);
        self.table.remove(&self.id).await;
    }

    /// Queue the final frame, and a transport close for fatal outcomes.
    async fn notify(&self, frame: Frame, close: bool) {
        let grace = self.settings.teardown_grace;
        let queued = async {
            self.outbound.send(Outbound::Frame(frame)).await.ok()?;
            if close {
                self.outbound.send(Outbound::Close).await.ok()?;
            }
            Some(())
        };
        if tokio::time::timeout(grace, queued).await.ok().flatten().is_none() {
            debug!(session_id = %self.id, "client gone before final frame");
        }
    }
}

/// Resolve with the first cancel reason. Never resolves if nobody can
/// cancel anymore.
async fn cancelled(cancel: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    if let Some(reason) = cancel.wait_for(Option::is_some).await.ok().and_then(|r| *r) {
        return reason;
    }
    std::future::pending().await
}

/// Client → device. Holds the writer until the queue closes or the task is
/// aborted.
async fn drain_input(writer: SharedWriter, mut ops: mpsc::Receiver<DeviceOp>) -> io::Result<()> {
    let mut writer = writer.lock().await;
    while let Some(op) = ops.recv().await {
        match op {
            DeviceOp::Write(data) => writer.write(data.as_bytes()).await?,
            DeviceOp::Resize { rows, cols } => writer.resize(rows, cols).await?,
        }
    }
    Ok(())
}

/// Device → client. Runs as its own task so a blocked device read never
/// stalls input handling.
async fn pump_output(
    mut reader: Box<dyn DeviceReader>,
    outbound: mpsc::Sender<Outbound>,
    status: Arc<SessionStatus>,
    buffer_bytes: usize,
) -> PumpExit {
    let mut buf = vec![0u8; buffer_bytes];
    let mut utf8 = Utf8Accumulator::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let rest = utf8.finish();
                if !rest.is_empty() {
                    let _ = outbound.send(Outbound::Frame(Frame::Output { data: rest })).await;
                }
                return PumpExit::Eof;
            }
            Ok(n) => n,
            Err(e) => return PumpExit::Failed(e),
        };
        status.touch();
        let data = utf8.push(&buf[..n]);
        if data.is_empty() {
            continue;
        }
        if outbound.send(Outbound::Frame(Frame::Output { data })).await.is_err() {
            return PumpExit::ClientGone;
        }
    }
}
