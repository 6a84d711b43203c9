//! Core functionality for the Pixl bridge
//! This module contains everything that talks to the peripheral.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{Action, SessionEvent, SessionHandle, SessionManager, SessionState};
