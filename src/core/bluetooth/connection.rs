//! Bluetooth connection handling for the Pixl peripheral
//! This module implements [`Transport`] on top of the platform adapter exposed by bluest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic as GattCharacteristic, Device};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ScanConfig;
use crate::core::bluetooth::notification::{LinkSignal, NotificationForwarder, watch_link};
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::transport::{LinkTag, Transport, TransportEvent};
use crate::core::bluetooth::types::{
    CharacteristicHandle, DeviceIdentifier, DiscoveredCharacteristic, DiscoveredService,
};
use crate::error::TransportError;

/// Devices seen by the scanner, keyed by platform id.
pub(crate) type KnownDevices = Arc<Mutex<HashMap<String, Device>>>;

pub(crate) fn map_bluest_error(err: bluest::Error) -> TransportError {
    match err.kind() {
        ErrorKind::AdapterUnavailable => TransportError::Unavailable,
        ErrorKind::NotConnected => TransportError::NotConnected,
        _ => TransportError::Failed(err.to_string()),
    }
}

/// State of the one live link.
struct Link {
    device: Device,
    characteristics: HashMap<CharacteristicHandle, GattCharacteristic>,
    /// Connection watcher and notification forwarders
    tasks: Vec<JoinHandle<()>>,
    signal: LinkSignal,
}

impl Link {
    fn new(device: Device, signal: LinkSignal, watcher: JoinHandle<()>) -> Self {
        Self {
            device,
            characteristics: HashMap::new(),
            tasks: vec![watcher],
            signal,
        }
    }

    fn characteristic(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<GattCharacteristic, TransportError> {
        self.characteristics
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct BluestTransport {
    adapter: Adapter,
    devices: KnownDevices,
    link: tokio::sync::Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl BluestTransport {
    /// Opens the default adapter and waits for it to become available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let adapter = Adapter::default().await.ok_or(TransportError::Unavailable)?;
        adapter.wait_available().await.map_err(map_bluest_error)?;
        info!("Bluetooth adapter is available.");

        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            link: tokio::sync::Mutex::new(None),
            events,
        };
        Ok((transport, rx))
    }

    /// A scanner that registers what it finds with this transport.
    pub fn scanner(&self, config: ScanConfig) -> BluetoothScanner {
        BluetoothScanner::new(self.adapter.clone(), self.devices.clone(), config)
    }

    fn known_device(&self, id: &DeviceIdentifier) -> Result<Device, TransportError> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))
    }

    async fn characteristic(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<GattCharacteristic, TransportError> {
        let link = self.link.lock().await;
        link.as_ref()
            .ok_or(TransportError::NotConnected)?
            .characteristic(handle)
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn connect(&self, id: &DeviceIdentifier, tag: LinkTag) -> Result<(), TransportError> {
        let device = self.known_device(id)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", id, name);

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter
                .connect_device(&device)
                .await
                .map_err(map_bluest_error)?;
        }
        info!("Connected to {} as link #{}", id, tag);

        let signal = LinkSignal::new(tag, self.events.clone());
        let watcher = tokio::spawn(watch_link(
            self.adapter.clone(),
            device.clone(),
            signal.clone(),
        ));

        let mut link = self.link.lock().await;
        if let Some(mut previous) = link.replace(Link::new(device, signal, watcher)) {
            previous.stop_tasks();
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let services = link.device.services().await.map_err(map_bluest_error)?;
        link.characteristics.clear();

        // Handles follow attribute-table order; each service declaration takes one slot.
        let mut next_handle: u16 = 1;
        let mut discovered = Vec::with_capacity(services.len());
        for service in services {
            next_handle = next_handle.wrapping_add(1);
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await.map_err(map_bluest_error)? {
                let handle = CharacteristicHandle(next_handle);
                next_handle = next_handle.wrapping_add(1);
                debug!(
                    "Service {} characteristic {} -> {}",
                    service.uuid(),
                    characteristic.uuid(),
                    handle
                );
                characteristics.push(DiscoveredCharacteristic {
                    uuid: characteristic.uuid(),
                    handle,
                });
                link.characteristics.insert(handle, characteristic);
            }
            info!("Available service: {}", service.uuid());
            discovered.push(DiscoveredService {
                uuid: service.uuid(),
                characteristics,
            });
        }
        Ok(discovered)
    }

    async fn read(&self, handle: CharacteristicHandle) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(handle).await?;
        characteristic.read().await.map_err(map_bluest_error)
    }

    async fn write(&self, handle: CharacteristicHandle, payload: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(handle).await?;
        debug!("Writing {:02x?} to {}", payload, handle);
        characteristic.write(payload).await.map_err(map_bluest_error)
    }

    async fn enable_notifications(&self, handle: CharacteristicHandle) -> Result<(), TransportError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let forwarder = NotificationForwarder {
            characteristic: link.characteristic(handle)?,
            handle,
            device: link.device.clone(),
            signal: link.signal.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(forwarder.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                link.tasks.push(task);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Failed(
                "notification task ended before subscribing".to_string(),
            )),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut link) = self.link.lock().await.take() else {
            info!("No device connected");
            return Ok(());
        };
        link.stop_tasks();

        if link.device.is_connected().await {
            info!("Disconnecting from device {}", link.device.id());
            self.adapter
                .disconnect_device(&link.device)
                .await
                .map_err(map_bluest_error)?;
            info!("Successfully disconnected");
        } else {
            warn!("Device {} was already disconnected", link.device.id());
        }
        Ok(())
    }
}
