use std::sync::PoisonError;

use anyhow::Result;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::core::bluetooth::connection::KnownDevices;
use crate::core::bluetooth::constants::{PIXL_NAME, UUID_SYM_SERVICE};
use crate::core::bluetooth::types::{DeviceIdentifier, DiscoveredDevice};

pub struct BluetoothScanner {
    adapter: Adapter,
    devices: KnownDevices,
    config: ScanConfig,
}

impl BluetoothScanner {
    pub(crate) fn new(adapter: Adapter, devices: KnownDevices, config: ScanConfig) -> Self {
        Self {
            adapter,
            devices,
            config,
        }
    }

    /// Looks for peripherals advertising the SYM service until the configured
    /// timeout elapses or `cancel` fires. Every hit becomes connectable through
    /// the transport that created this scanner.
    pub async fn scan(&self, cancel: CancellationToken) -> Result<Vec<DiscoveredDevice>> {
        let mut found: Vec<DiscoveredDevice> = Vec::new();

        info!("Checking for connected devices");
        for device in self.adapter.connected_devices().await? {
            if Self::is_pixl(&device) {
                let discovered = self.register(device, None, vec![UUID_SYM_SERVICE]);
                info!("Found connected Pixl device: {}", discovered.id);
                found.push(discovered);
            }
        }
        if !found.is_empty() {
            return Ok(found);
        }

        info!("Starting bluetooth scan for {:?}", self.config.timeout());
        let mut scan_stream = self.adapter.scan(&[UUID_SYM_SERVICE]).await?;
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(advertising) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    debug!("Found device - Device: {:?}, RSSI: {:?}", advertising.device, advertising.rssi);

                    if advertising.rssi.is_some_and(|rssi| rssi < self.config.min_rssi) {
                        continue;
                    }
                    if !advertising.adv_data.services.contains(&UUID_SYM_SERVICE) {
                        continue;
                    }
                    let id = advertising.device.id().to_string();
                    if found.iter().any(|d| d.id.as_str() == id) {
                        continue;
                    }

                    let discovered = self.register(
                        advertising.device,
                        advertising.rssi,
                        advertising.adv_data.services.clone(),
                    );
                    info!(
                        "Found Pixl device: Address: {:?}, ID: {}, Name: {:?}, RSSI: {:?}",
                        discovered.address, discovered.id, discovered.name, discovered.rssi
                    );
                    found.push(discovered);
                }
                _ = &mut deadline => {
                    info!("Scan timeout reached");
                    break;
                }
                _ = cancel.cancelled() => {
                    info!("Scan cancelled");
                    break;
                }
            }
        }

        Ok(found)
    }

    fn register(
        &self,
        device: Device,
        rssi: Option<i16>,
        services: Vec<uuid::Uuid>,
    ) -> DiscoveredDevice {
        let id = device.id().to_string();
        let name = device.name().ok();
        let address = extract_mac_address(&id);

        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), device);

        DiscoveredDevice {
            id: DeviceIdentifier::new(id),
            name,
            address,
            rssi,
            services,
        }
    }

    fn is_pixl(device: &Device) -> bool {
        device
            .name()
            .is_ok_and(|name| name.starts_with(PIXL_NAME))
    }
}

/// Pulls a MAC address out of a platform device id, if it embeds one.
fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}
