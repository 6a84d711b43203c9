//! Abstract link-layer transport
//! Every primitive is asynchronous and individually failable. Unsolicited traffic
//! (notifications, link loss) is delivered on the event channel handed out by the
//! transport's constructor, tagged with the link it belongs to.

use async_trait::async_trait;

use crate::core::bluetooth::types::{CharacteristicHandle, DeviceIdentifier, DiscoveredService};
use crate::error::TransportError;

/// Caller-chosen tag of one link. Every event raised on that link carries it.
pub type LinkTag = u64;

/// Unsolicited transport events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification {
        link: LinkTag,
        handle: CharacteristicHandle,
        value: Vec<u8>,
    },
    LinkLost {
        link: LinkTag,
    },
}

impl TransportEvent {
    pub fn link(&self) -> LinkTag {
        match self {
            Self::Notification { link, .. } | Self::LinkLost { link } => *link,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a link to `device`. Events raised on it are tagged with `link`.
    async fn connect(&self, device: &DeviceIdentifier, link: LinkTag)
    -> Result<(), TransportError>;

    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError>;

    async fn read(&self, handle: CharacteristicHandle) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, handle: CharacteristicHandle, payload: &[u8])
    -> Result<(), TransportError>;

    /// Subscribes to notifications; values then arrive as [`TransportEvent::Notification`].
    async fn enable_notifications(&self, handle: CharacteristicHandle)
    -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
