//! Bluetooth session engine for the SYM Pixl peripheral
//! This module handles scanning, the per-connection state machine, the
//! serialized operation queue and the wire codec of the Pixl characteristics.

mod codec;
mod commands;
mod connection;
mod constants;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod manager;
mod notification;
mod queue;
mod registry;
mod scanner;
mod session;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use codec::{
    Clock, FixedClock, SystemClock, decode_click_count, decode_datetime, decode_temperature,
    encode_datetime, encode_datetime_now, encode_int32,
};
pub use commands::{Action, SessionHandle};
pub use connection::BluestTransport;
pub use constants::*; // Re-export all constants
#[cfg(any(test, feature = "test-util"))]
pub use fake::{FakeTransport, TransportCall};
pub use manager::SessionManager;
pub use queue::{Dispatcher, Operation, OperationId, OperationKind, OperationQueue, OperationResult};
pub use registry::ServiceRegistry;
pub use scanner::BluetoothScanner;
pub use transport::{LinkTag, Transport, TransportEvent};
pub use types::{
    Characteristic, CharacteristicHandle, DateTime, DecodedValue, DeviceIdentifier,
    DiscoveredCharacteristic, DiscoveredDevice, DiscoveredService, SessionEvent, SessionSnapshot,
    SessionState, display_temperature,
};
