//! meter-relay-core: shared protocol library for the meter remote-access relay.
//!
//! Provides the client-facing frame type and JSON codec, the relay error
//! taxonomy, meter handles, and the abstract device transport traits that
//! connectors implement.

pub mod codec;
pub mod error;
pub mod frame;
pub mod meter;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Utf8Accumulator};
pub use error::{ConnectError, RelayError, RelayResult};
pub use frame::Frame;
pub use meter::MeterHandle;
pub use transport::{BoxFuture, DeviceConnector, DeviceReader, DeviceStream, DeviceWriter};
