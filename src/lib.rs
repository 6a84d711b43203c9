//! Pixl bridge library
//! A BLE central that drives the SYM Pixl peripheral through a single
//! serialized session: clock sync, integer writes, temperature reads and
//! notification decoding.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;

pub use config::AppConfig;
pub use error::{SessionError, TransportError};
pub use state::AppState;
