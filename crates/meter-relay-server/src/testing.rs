//! In-memory device connector and client harness for gateway tests.

use crate::auth::{AccessPolicy, Authorizer};
use crate::directory::DeviceDirectory;
use crate::gateway::{ClientLink, Gateway, GatewaySettings};
use crate::session::Outbound;
use meter_relay_core::{
    BoxFuture, ConnectError, DeviceConnector, DeviceReader, DeviceStream, DeviceWriter, Frame,
    MeterHandle,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the mock device behind one meter behaves.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Open succeeds; every write is echoed back as output.
    Echo,
    /// Open succeeds; reads block until the stream is closed.
    Silent,
    /// Open succeeds; the first read reports end of stream.
    Eof,
    /// Open succeeds; reads block, and writes and resizes are recorded but
    /// never complete.
    StallWrites,
    /// Open never resolves.
    Hang,
    /// Open fails with the given error.
    Fail(ConnectError),
}

/// What happened to one mock device.
#[derive(Debug, Default)]
pub struct MockDeviceState {
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MockDeviceState {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Connector whose devices live in memory. Unconfigured meters echo.
#[derive(Default)]
pub struct MockConnector {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    devices: Mutex<HashMap<String, Arc<MockDeviceState>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, meter_id: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(meter_id.to_string(), behavior);
    }

    pub fn device(&self, meter_id: &str) -> Arc<MockDeviceState> {
        self.devices
            .lock()
            .unwrap()
            .entry(meter_id.to_string())
            .or_default()
            .clone()
    }

    fn behavior(&self, meter_id: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(meter_id)
            .cloned()
            .unwrap_or(MockBehavior::Echo)
    }
}

impl DeviceConnector for MockConnector {
    fn open<'a>(
        &'a self,
        handle: &'a MeterHandle,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<DeviceStream, ConnectError>> {
        let behavior = self.behavior(&handle.meter_id);
        let state = self.device(&handle.meter_id);
        Box::pin(async move {
            state.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let (tx, echo, stall) = match behavior {
                MockBehavior::Hang => return std::future::pending().await,
                MockBehavior::Fail(e) => return Err(e),
                MockBehavior::Echo => (Some(tx), true, false),
                MockBehavior::Silent => (Some(tx), false, false),
                MockBehavior::Eof => (None, false, false),
                MockBehavior::StallWrites => (Some(tx), false, true),
            };
            Ok(DeviceStream::new(
                Box::new(MockReader {
                    rx,
                    leftover: Vec::new(),
                }),
                Box::new(MockWriter {
                    tx,
                    echo,
                    stall,
                    state,
                }),
            ))
        })
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl DeviceReader for MockReader {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.leftover.is_empty() {
                match self.rx.recv().await {
                    Some(chunk) => self.leftover = chunk,
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

struct MockWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    echo: bool,
    stall: bool,
    state: Arc<MockDeviceState>,
}

impl DeviceWriter for MockWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.state.writes.lock().unwrap().push(data.to_vec());
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.echo {
                if let Some(tx) = &self.tx {
                    let _ = tx.send(data.to_vec());
                }
            }
            Ok(())
        })
    }

    fn resize(&mut self, rows: u16, cols: u16) -> BoxFuture<'_, io::Result<()>> {
        self.state.resizes.lock().unwrap().push((rows, cols));
        let stall = self.stall;
        Box::pin(async move {
            if stall {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

/// Directory with M-001..M-003 online.
pub fn test_directory() -> Arc<DeviceDirectory> {
    let directory = Arc::new(DeviceDirectory::new(Duration::from_secs(30)));
    directory.replace(vec![
        MeterHandle::new("M-001", 9001, 4242),
        MeterHandle::new("M-002", 9002, 4343),
        MeterHandle::new("M-003", 9003, 4444),
    ]);
    directory
}

pub fn test_gateway(connector: Arc<MockConnector>, settings: GatewaySettings) -> Arc<Gateway> {
    test_gateway_with_policy(connector, settings, Arc::new(AccessPolicy::default()))
}

pub fn test_gateway_with_policy(
    connector: Arc<MockConnector>,
    settings: GatewaySettings,
    authorizer: Arc<dyn Authorizer>,
) -> Arc<Gateway> {
    Arc::new(Gateway::new(test_directory(), connector, authorizer, settings))
}

/// A client link plus the receiving end of its outbound queue.
pub fn client(gateway: &Arc<Gateway>) -> (ClientLink, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(256);
    (ClientLink::new(gateway.clone(), tx, "test-client".into()), rx)
}

pub fn connect(meter_id: &str, user_id: &str) -> Frame {
    Frame::Connect {
        meter_id: meter_id.into(),
        port: None,
        user_id: user_id.into(),
    }
}

/// Next queued outbound message, failing the test after five seconds.
pub async fn next_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound queue closed")
}

/// Poll until the gateway has no live sessions.
pub async fn wait_drained(gateway: &Gateway) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions did not finish");
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
