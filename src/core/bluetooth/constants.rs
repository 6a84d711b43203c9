//! Constants used throughout the bluetooth module
//! This module contains the well-known UUIDs of the Pixl peripheral,
//! payload sizes and the default timing values.

use uuid::Uuid;

/// Advertised name prefix of the SYM Pixl peripheral
pub const PIXL_NAME: &str = "SYM";

/// Standard Current Time Service
pub const UUID_TIME_SERVICE: Uuid = Uuid::from_u128(0x00001805_0000_1000_8000_00805f9b34fb);

/// Standard Current Time characteristic (read / write / notify)
pub const UUID_CURRENT_TIME_CHAR: Uuid = Uuid::from_u128(0x00002a2b_0000_1000_8000_00805f9b34fb);

/// The UUID of the custom SYM service
pub const UUID_SYM_SERVICE: Uuid = Uuid::from_u128(0x3c0a1000_281d_4b48_b2a7_f15579a1c38f);

/// Signed 32-bit integer sink (write)
pub const UUID_INTEGER_CHAR: Uuid = Uuid::from_u128(0x3c0a1001_281d_4b48_b2a7_f15579a1c38f);

/// Temperature in tenths of a degree (read / notify)
pub const UUID_TEMPERATURE_CHAR: Uuid = Uuid::from_u128(0x3c0a1002_281d_4b48_b2a7_f15579a1c38f);

/// Button click counter (notify)
pub const UUID_CLICK_COUNTER_CHAR: Uuid = Uuid::from_u128(0x3c0a1003_281d_4b48_b2a7_f15579a1c38f);

/// Number of automatic retries after a failed initial connect
pub const DEFAULT_CONNECT_RETRIES: u32 = 1;

/// Delay before the connect retry in milliseconds
pub const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 15;

/// Advertisements weaker than this are ignored by the scanner
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Capacity of the command channel between handles and the session task
pub const DEFAULT_COMMAND_BUFFER: usize = 32;

/// CurrentTime payload size in bytes
pub const DATETIME_PACKET_SIZE: usize = 7;

/// Temperature payload size in bytes
pub const TEMPERATURE_PACKET_SIZE: usize = 2;

/// ClickCounter payload size in bytes
pub const CLICK_COUNT_PACKET_SIZE: usize = 1;

/// Integer payload size in bytes
pub const INTEGER_PACKET_SIZE: usize = 4;
