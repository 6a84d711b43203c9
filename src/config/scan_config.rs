use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{DEFAULT_SCAN_DURATION_SECS, MIN_RSSI_THRESHOLD};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long a scan runs before it stops on its own.
    pub timeout_secs: u64,

    /// Advertisements below this signal strength are ignored.
    pub min_rssi: i16,
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            min_rssi: MIN_RSSI_THRESHOLD,
        }
    }
}
