//! Resolution of the Pixl characteristic handles from a discovered service table

use log::{debug, info};

use crate::core::bluetooth::constants::{UUID_SYM_SERVICE, UUID_TIME_SERVICE};
use crate::core::bluetooth::types::{Characteristic, CharacteristicHandle, DiscoveredService};
use crate::error::SessionError;

/// The four characteristic handles a session needs. Only constructed fully resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRegistry {
    current_time: CharacteristicHandle,
    integer: CharacteristicHandle,
    temperature: CharacteristicHandle,
    click_counter: CharacteristicHandle,
}

impl ServiceRegistry {
    /// Scans every discovered service and resolves the required handles.
    /// Returns `Unsupported` unless all four are present.
    pub fn validate(services: &[DiscoveredService]) -> Result<Self, SessionError> {
        let mut current_time = None;
        let mut integer = None;
        let mut temperature = None;
        let mut click_counter = None;

        for service in services {
            debug!("Available service: {}", service.uuid);
            if service.uuid == UUID_TIME_SERVICE {
                for char in &service.characteristics {
                    if char.uuid == Characteristic::CurrentTime.uuid() {
                        current_time = Some(char.handle);
                    }
                }
            } else if service.uuid == UUID_SYM_SERVICE {
                for char in &service.characteristics {
                    if char.uuid == Characteristic::Integer.uuid() {
                        integer = Some(char.handle);
                    } else if char.uuid == Characteristic::Temperature.uuid() {
                        temperature = Some(char.handle);
                    } else if char.uuid == Characteristic::ClickCounter.uuid() {
                        click_counter = Some(char.handle);
                    }
                }
            }
        }

        match (current_time, integer, temperature, click_counter) {
            (Some(current_time), Some(integer), Some(temperature), Some(click_counter)) => {
                info!(
                    "Resolved handles - time: {}, integer: {}, temperature: {}, clicks: {}",
                    current_time, integer, temperature, click_counter
                );
                Ok(Self {
                    current_time,
                    integer,
                    temperature,
                    click_counter,
                })
            }
            _ => Err(SessionError::Unsupported),
        }
    }

    pub fn handle(&self, characteristic: Characteristic) -> CharacteristicHandle {
        match characteristic {
            Characteristic::CurrentTime => self.current_time,
            Characteristic::Integer => self.integer,
            Characteristic::Temperature => self.temperature,
            Characteristic::ClickCounter => self.click_counter,
        }
    }

    /// Reverse lookup used to route notifications.
    pub fn characteristic_for(&self, handle: CharacteristicHandle) -> Option<Characteristic> {
        Characteristic::ALL
            .into_iter()
            .find(|c| self.handle(*c) == handle)
    }
}
