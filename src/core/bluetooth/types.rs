//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_CLICK_COUNTER_CHAR, UUID_CURRENT_TIME_CHAR, UUID_INTEGER_CHAR, UUID_SYM_SERVICE,
    UUID_TEMPERATURE_CHAR, UUID_TIME_SERVICE,
};
use crate::error::SessionError;

/// Platform-specific identifier of a peripheral, as produced by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentifier(String);

impl DeviceIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device
    pub id: DeviceIdentifier,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The MAC address when the platform id embeds one
    pub address: Option<String>,
    /// The signal strength (RSSI) of the advertisement
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement
    pub services: Vec<Uuid>,
}

/// The four characteristics the session works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Characteristic {
    CurrentTime,
    Integer,
    Temperature,
    ClickCounter,
}

impl Characteristic {
    pub const ALL: [Characteristic; 4] = [
        Characteristic::CurrentTime,
        Characteristic::Integer,
        Characteristic::Temperature,
        Characteristic::ClickCounter,
    ];

    /// UUID of the service hosting this characteristic
    pub fn service_uuid(self) -> Uuid {
        match self {
            Self::CurrentTime => UUID_TIME_SERVICE,
            Self::Integer | Self::Temperature | Self::ClickCounter => UUID_SYM_SERVICE,
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            Self::CurrentTime => UUID_CURRENT_TIME_CHAR,
            Self::Integer => UUID_INTEGER_CHAR,
            Self::Temperature => UUID_TEMPERATURE_CHAR,
            Self::ClickCounter => UUID_CLICK_COUNTER_CHAR,
        }
    }
}

/// Transport-assigned attribute handle of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Wall-clock fields as carried by the CurrentTime characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}:{:02}:{:02}",
            self.day, self.month, self.year, self.hour, self.minute, self.second
        )
    }
}

/// A value decoded from a read or a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodedValue {
    /// Tenths of a degree
    Temperature(u16),
    ClickCount(u8),
    DateTime(DateTime),
}

/// Converts a temperature in tenths of a degree to the whole-degree display value.
pub fn display_temperature(tenths: u16) -> u16 {
    tenths / 10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Discovering,
    Arming,
    Ready,
    Disconnecting,
}

/// Events delivered to the observer, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged(SessionState),
    TemperatureUpdated(u16),
    ClickCountUpdated(u8),
    DatetimeUpdated(DateTime),
    UnsupportedDevice,
    ConnectFailed(SessionError),
    OperationFailed {
        operation: String,
        error: SessionError,
    },
}

/// Point-in-time view of the session, for observers that poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub device: Option<DeviceIdentifier>,
    pub registry_resolved: bool,
    pub in_flight: Option<String>,
    pub pending: usize,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            device: None,
            registry_resolved: false,
            in_flight: None,
            pending: 0,
        }
    }
}
