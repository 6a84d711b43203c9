//! Session commands
//! `SessionHandle` is the clonable, collaborator-facing API. Every call is forwarded to
//! the session task and returns as soon as the task has decided whether to accept it.

use log::warn;
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::codec;
use crate::core::bluetooth::queue::OperationResult;
use crate::core::bluetooth::types::{
    DecodedValue, DeviceIdentifier, SessionSnapshot, SessionState,
};
use crate::error::SessionError;

/// User-triggered operations accepted in the `Ready` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Read the Temperature characteristic
    ReadTemperature,
    /// Write a signed 32-bit value to the Integer characteristic
    SendInt(i32),
    /// Write the local wall-clock time to the CurrentTime characteristic
    UpdateDatetime,
}

pub(crate) enum SessionCommand {
    Connect {
        device: DeviceIdentifier,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    Submit {
        action: Action,
        reply: oneshot::Sender<bool>,
        completion: Option<oneshot::Sender<OperationResult>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// A clonable handle that sends commands to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    /// Opens a session to `device`. Returns `false` if a session is already active.
    pub async fn connect(&self, device: DeviceIdentifier) -> bool {
        self.request(|reply| SessionCommand::Connect { device, reply })
            .await
            .unwrap_or(false)
    }

    /// Tears the active session down. Returns `false` if there is nothing to disconnect.
    pub async fn disconnect(&self) -> bool {
        self.request(|reply| SessionCommand::Disconnect { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn read_temperature(&self) -> bool {
        self.submit(Action::ReadTemperature, None).await
    }

    pub async fn send_int(&self, value: i32) -> bool {
        self.submit(Action::SendInt(value), None).await
    }

    pub async fn update_datetime(&self) -> bool {
        self.submit(Action::UpdateDatetime, None).await
    }

    /// Submits `action` and waits for the operation to complete.
    /// Reads resolve to the decoded value, writes to `None`.
    pub async fn perform(&self, action: Action) -> Result<Option<DecodedValue>, SessionError> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(action, Some(tx)).await {
            return Err(SessionError::OperationRejected(format!(
                "{:?} requires a ready session",
                action
            )));
        }
        let payload = rx.await.map_err(|_| SessionError::LinkLost)??;
        match (action, payload) {
            (Action::ReadTemperature, Some(bytes)) => {
                Ok(Some(DecodedValue::Temperature(codec::decode_temperature(&bytes)?)))
            }
            _ => Ok(None),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.snapshot().await.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
            .unwrap_or_else(SessionSnapshot::idle)
    }

    async fn submit(
        &self,
        action: Action,
        completion: Option<oneshot::Sender<OperationResult>>,
    ) -> bool {
        self.request(|reply| SessionCommand::Submit {
            action,
            reply,
            completion,
        })
        .await
        .unwrap_or(false)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if let Err(e) = self.tx.send(command(reply)).await {
            warn!("Session task is gone, dropping command: {}", e);
            return None;
        }
        rx.await.ok()
    }
}
