//! Abstract device transport traits.
//!
//! A connector opens a byte stream to a meter's local agent. The stream is
//! split into a reader and a writer so both forwarding directions can run
//! at the same time without sharing a lock.

use crate::error::ConnectError;
use crate::meter::MeterHandle;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Device-to-client half of a device stream.
pub trait DeviceReader: Send {
    /// Read up to `buf.len()` bytes. Returns number of bytes read, 0 = EOF.
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;
}

/// Client-to-device half of a device stream, plus its control calls.
pub trait DeviceWriter: Send {
    /// Write all bytes.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Apply a terminal resize on the device side.
    fn resize(&mut self, rows: u16, cols: u16) -> BoxFuture<'_, io::Result<()>>;

    /// Close the device stream. Called at most once per stream.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// An open connection to a meter's terminal agent.
pub struct DeviceStream {
    reader: Box<dyn DeviceReader>,
    writer: Box<dyn DeviceWriter>,
}

impl DeviceStream {
    pub fn new(reader: Box<dyn DeviceReader>, writer: Box<dyn DeviceWriter>) -> Self {
        Self { reader, writer }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write(data).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.close().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (Box<dyn DeviceReader>, Box<dyn DeviceWriter>) {
        (self.reader, self.writer)
    }
}

/// Opens device streams for meter handles.
pub trait DeviceConnector: Send + Sync {
    /// Open a stream to the agent behind `handle`, giving up after `timeout`.
    fn open<'a>(
        &'a self,
        handle: &'a MeterHandle,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<DeviceStream, ConnectError>>;
}
