use serde::Serialize;
use thiserror::Error;

use crate::core::bluetooth::CharacteristicHandle;

/// Error type for session operations and payload decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionError {
    #[error("bluetooth adapter unavailable")]
    TransportUnavailable,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("link lost")]
    LinkLost,

    #[error("device does not expose the required services")]
    Unsupported,

    #[error("malformed payload: expected {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    #[error("operation rejected: {0}")]
    OperationRejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors reported by a [`Transport`](crate::core::bluetooth::Transport) primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth adapter unavailable")]
    Unavailable,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("not connected")]
    NotConnected,

    #[error("unknown characteristic handle {0}")]
    UnknownHandle(CharacteristicHandle),

    #[error("{0}")]
    Failed(String),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => SessionError::TransportUnavailable,
            TransportError::NotConnected => SessionError::LinkLost,
            other => SessionError::Transport(other.to_string()),
        }
    }
}
