//! JSON codec for client frames, plus UTF-8 framing of device output.
//!
//! The codec is stateless and shared by every session. Decoding fails closed:
//! unknown tags, missing fields and out-of-range numbers are all errors.

use crate::error::{RelayError, RelayResult};
use crate::frame::Frame;

/// Encode a frame as a JSON text message.
pub fn encode(frame: &Frame) -> RelayResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a JSON text message into a frame.
pub fn decode(data: &[u8]) -> RelayResult<Frame> {
    serde_json::from_slice(data).map_err(|e| RelayError::Codec(e.to_string()))
}

/// Turns a stream of device reads into valid UTF-8 text chunks.
///
/// A multi-byte sequence cut by a read boundary is held back until the next
/// read completes it. Invalid sequences are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one device read and return the text that is ready to send.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let held = incomplete_tail(&self.pending);
        let ready = self.pending.len() - held;
        let text = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        text
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }

    /// Number of bytes held back waiting for the rest of a sequence.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let need = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if need > have { have } else { 0 };
    }
    0
}
