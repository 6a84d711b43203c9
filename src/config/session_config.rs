use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    DEFAULT_COMMAND_BUFFER, DEFAULT_CONNECT_RETRIES, DEFAULT_CONNECT_RETRY_DELAY_MS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Automatic retries after a failed initial connect. Later failures are terminal.
    pub connect_retries: u32,

    /// Fixed delay before each connect retry, in milliseconds.
    pub connect_retry_delay_ms: u64,

    /// Capacity of the command channel feeding the session task.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_retry_delay_ms: DEFAULT_CONNECT_RETRY_DELAY_MS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}
