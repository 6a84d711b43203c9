//! Payload encoding and decoding for the Pixl characteristics
//! All functions are pure; multi-byte fields are little-endian.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use crate::core::bluetooth::constants::{
    CLICK_COUNT_PACKET_SIZE, DATETIME_PACKET_SIZE, TEMPERATURE_PACKET_SIZE,
};
use crate::core::bluetooth::types::DateTime;
use crate::error::SessionError;

/// Source of the local wall-clock time written to the CurrentTime characteristic.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the system clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

impl From<NaiveDateTime> for DateTime {
    fn from(value: NaiveDateTime) -> Self {
        Self {
            year: value.year().clamp(0, u16::MAX as i32) as u16,
            month: value.month() as u8,
            day: value.day() as u8,
            hour: value.hour() as u8,
            minute: value.minute() as u8,
            second: value.second() as u8,
        }
    }
}

fn malformed(expected: usize, bytes: &[u8]) -> SessionError {
    SessionError::MalformedPayload {
        expected,
        actual: bytes.len(),
    }
}

/// Decodes the single-byte click counter.
pub fn decode_click_count(bytes: &[u8]) -> Result<u8, SessionError> {
    match bytes {
        [count] => Ok(*count),
        _ => Err(malformed(CLICK_COUNT_PACKET_SIZE, bytes)),
    }
}

pub fn decode_datetime(bytes: &[u8]) -> Result<DateTime, SessionError> {
    if bytes.len() < DATETIME_PACKET_SIZE {
        return Err(malformed(DATETIME_PACKET_SIZE, bytes));
    }
    Ok(DateTime {
        year: u16::from_le_bytes([bytes[0], bytes[1]]),
        month: bytes[2],
        day: bytes[3],
        hour: bytes[4],
        minute: bytes[5],
        second: bytes[6],
    })
}

/// Decodes the temperature in tenths of a degree.
pub fn decode_temperature(bytes: &[u8]) -> Result<u16, SessionError> {
    match bytes {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(malformed(TEMPERATURE_PACKET_SIZE, bytes)),
    }
}

pub fn encode_int32(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn encode_datetime(value: &DateTime) -> [u8; DATETIME_PACKET_SIZE] {
    let [year_lo, year_hi] = value.year.to_le_bytes();
    [
        year_lo,
        year_hi,
        value.month,
        value.day,
        value.hour,
        value.minute,
        value.second,
    ]
}

/// Encodes the clock's current reading. No timezone conversion is applied.
pub fn encode_datetime_now(clock: &dyn Clock) -> [u8; DATETIME_PACKET_SIZE] {
    encode_datetime(&DateTime::from(clock.now()))
}
