//! Notification forwarding and link supervision for the bluest transport
//! Each subscribed characteristic gets a task that pushes its values onto the
//! transport event channel. One more task per link watches the connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bluest::{Adapter, Characteristic as GattCharacteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::connection::map_bluest_error;
use crate::core::bluetooth::transport::{LinkTag, TransportEvent};
use crate::core::bluetooth::types::CharacteristicHandle;
use crate::error::TransportError;

/// Event sink of one link. Shared by all of its tasks so that link loss is reported once.
#[derive(Clone)]
pub(crate) struct LinkSignal {
    link: LinkTag,
    events: mpsc::UnboundedSender<TransportEvent>,
    lost: Arc<AtomicBool>,
}

impl LinkSignal {
    pub(crate) fn new(link: LinkTag, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            link,
            events,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `false` once the receiver is gone.
    fn notify(&self, handle: CharacteristicHandle, value: Vec<u8>) -> bool {
        let event = TransportEvent::Notification {
            link: self.link,
            handle,
            value,
        };
        self.events.send(event).is_ok()
    }

    fn report_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            info!("Link #{} lost", self.link);
            let _ = self.events.send(TransportEvent::LinkLost { link: self.link });
        }
    }
}

pub(crate) struct NotificationForwarder {
    pub characteristic: GattCharacteristic,
    pub handle: CharacteristicHandle,
    pub device: Device,
    pub signal: LinkSignal,
}

impl NotificationForwarder {
    /// Subscribes, reports the subscription outcome on `ready`, then forwards values
    /// until the stream ends.
    pub(crate) async fn run(self, ready: oneshot::Sender<Result<(), TransportError>>) {
        info!(
            "Subscribing to notifications on {} ({})",
            self.characteristic.uuid(),
            self.handle
        );

        match self.characteristic.notify().await {
            Ok(mut notification_stream) => {
                let _ = ready.send(Ok(()));
                while let Some(result) = notification_stream.next().await {
                    match result {
                        Ok(value) => {
                            debug!("Received notification on {}: {:02x?}", self.handle, value);
                            if !self.signal.notify(self.handle, value) {
                                debug!("Transport event receiver dropped");
                                return;
                            }
                        }
                        Err(e) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                let _ = ready.send(Err(map_bluest_error(e)));
                return;
            }
        }

        info!("Notification stream on {} ended", self.handle);
        if !self.device.is_connected().await {
            self.signal.report_lost();
        }
    }
}

/// Watches the connection state of a device from connect until the link is released.
pub(crate) async fn watch_link(adapter: Adapter, device: Device, signal: LinkSignal) {
    let connection_events = match adapter.device_connection_events(&device).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch connection state of {}: {}", device.id(), e);
            return;
        }
    };
    tokio::pin!(connection_events);

    while let Some(event) = connection_events.next().await {
        if matches!(event, ConnectionEvent::Disconnected) {
            debug!("{} reported disconnected", device.id());
            signal.report_lost();
            return;
        }
    }
}
