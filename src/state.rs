//! Application state management
//! This module wires the bluest transport, the scanner and the session task together.

use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::bluetooth::{
    BluestTransport, BluetoothScanner, DiscoveredDevice, SessionEvent, SessionHandle,
    SessionManager, SystemClock,
};

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    scanner: BluetoothScanner,
    session: SessionHandle,
}

impl AppState {
    /// Opens the adapter and starts the session task.
    /// The returned receiver carries every session event in order.
    pub async fn new(config: AppConfig) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        info!("Initializing bluetooth transport...");
        let (transport, transport_events) = BluestTransport::new().await?;
        let scanner = transport.scanner(config.scan.clone());

        let (session, events) = SessionManager::spawn(
            Arc::new(transport),
            transport_events,
            config.session.clone(),
            Arc::new(SystemClock),
        );

        Ok((
            Self {
                config,
                scanner,
                session,
            },
            events,
        ))
    }

    /// Scans for Pixl peripherals. Anything returned can be passed to `session().connect`.
    pub async fn scan(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let devices = self.scanner.scan(cancel).await?;
        info!("Scan finished, {} device(s) found", devices.len());
        Ok(devices)
    }

    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }
}
