//! Scripted in-memory transport
//! Serves a fixed Pixl service table, records every call and lets the caller inject
//! notifications, link loss and connect failures. Discovery, notify-enable and write
//! can be held at a gate until the caller releases them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::core::bluetooth::constants::{UUID_SYM_SERVICE, UUID_TIME_SERVICE};
use crate::core::bluetooth::transport::{LinkTag, Transport, TransportEvent};
use crate::core::bluetooth::types::{
    Characteristic, CharacteristicHandle, DeviceIdentifier, DiscoveredCharacteristic,
    DiscoveredService,
};
use crate::error::TransportError;

const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// Handle the fake service table assigns to each characteristic.
pub fn fake_handle(characteristic: Characteristic) -> CharacteristicHandle {
    match characteristic {
        Characteristic::CurrentTime => CharacteristicHandle(0x0012),
        Characteristic::Integer => CharacteristicHandle(0x0022),
        Characteristic::Temperature => CharacteristicHandle(0x0025),
        Characteristic::ClickCounter => CharacteristicHandle(0x0028),
    }
}

/// The service table of a genuine Pixl.
pub fn pixl_services() -> Vec<DiscoveredService> {
    let char_of = |c: Characteristic| DiscoveredCharacteristic {
        uuid: c.uuid(),
        handle: fake_handle(c),
    };
    vec![
        DiscoveredService {
            uuid: UUID_GENERIC_ACCESS_SERVICE,
            characteristics: vec![DiscoveredCharacteristic {
                uuid: UUID_DEVICE_NAME,
                handle: CharacteristicHandle(0x0003),
            }],
        },
        DiscoveredService {
            uuid: UUID_TIME_SERVICE,
            characteristics: vec![char_of(Characteristic::CurrentTime)],
        },
        DiscoveredService {
            uuid: UUID_SYM_SERVICE,
            characteristics: vec![
                char_of(Characteristic::Integer),
                char_of(Characteristic::Temperature),
                char_of(Characteristic::ClickCounter),
            ],
        },
    ]
}

/// A transport primitive as seen by the fake, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(DeviceIdentifier),
    DiscoverServices,
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    EnableNotifications(CharacteristicHandle),
    Disconnect,
}

#[derive(Debug, Default)]
struct FakeState {
    connect_outcomes: VecDeque<Result<(), TransportError>>,
    services: Vec<DiscoveredService>,
    values: HashMap<CharacteristicHandle, Vec<u8>>,
    notify_failures: HashSet<CharacteristicHandle>,
    calls: Vec<TransportCall>,
    connected: bool,
    link: LinkTag,
}

/// Blocks a primitive until permits are released.
#[derive(Debug, Default)]
struct Gate(Option<Arc<Semaphore>>);

impl Gate {
    fn closed() -> Self {
        Self(Some(Arc::new(Semaphore::new(0))))
    }

    fn release(&self, count: usize) {
        if let Some(semaphore) = &self.0 {
            semaphore.add_permits(count);
        }
    }

    async fn pass(&self) -> Result<(), TransportError> {
        if let Some(semaphore) = &self.0 {
            semaphore
                .acquire()
                .await
                .map_err(|e| TransportError::Failed(e.to_string()))?
                .forget();
        }
        Ok(())
    }
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    discovery_gate: Gate,
    notify_gate: Gate,
    write_gate: Gate,
    disconnect_delay: Option<Duration>,
}

impl FakeTransport {
    /// Creates a fake serving [`pixl_services`], with its event receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = FakeState {
            services: pixl_services(),
            ..FakeState::default()
        };
        (
            Self {
                state: Mutex::new(state),
                events,
                discovery_gate: Gate::default(),
                notify_gate: Gate::default(),
                write_gate: Gate::default(),
                disconnect_delay: None,
            },
            rx,
        )
    }

    pub fn with_services(self, services: Vec<DiscoveredService>) -> Self {
        self.lock().services = services;
        self
    }

    /// Outcomes for successive connect attempts; attempts beyond the list succeed.
    pub fn with_connect_outcomes(self, outcomes: Vec<Result<(), TransportError>>) -> Self {
        self.lock().connect_outcomes = outcomes.into();
        self
    }

    pub fn with_value(self, characteristic: Characteristic, value: Vec<u8>) -> Self {
        self.lock().values.insert(fake_handle(characteristic), value);
        self
    }

    pub fn with_notify_failure(self, characteristic: Characteristic) -> Self {
        self.lock().notify_failures.insert(fake_handle(characteristic));
        self
    }

    /// Writes block until [`release_writes`](Self::release_writes) hands out permits.
    pub fn with_gated_writes(mut self) -> Self {
        self.write_gate = Gate::closed();
        self
    }

    /// Discovery blocks until [`release_discovery`](Self::release_discovery).
    pub fn with_gated_discovery(mut self) -> Self {
        self.discovery_gate = Gate::closed();
        self
    }

    /// Notify-enables block until [`release_notifications`](Self::release_notifications).
    pub fn with_gated_notifications(mut self) -> Self {
        self.notify_gate = Gate::closed();
        self
    }

    /// Each disconnect takes `delay` before it completes.
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = Some(delay);
        self
    }

    pub fn release_writes(&self, count: usize) {
        self.write_gate.release(count);
    }

    pub fn release_discovery(&self, count: usize) {
        self.discovery_gate.release(count);
    }

    pub fn release_notifications(&self, count: usize) {
        self.notify_gate.release(count);
    }

    /// Sends a notification on the current link.
    pub fn notify(&self, characteristic: Characteristic, value: Vec<u8>) {
        let link = self.lock().link;
        let _ = self.events.send(TransportEvent::Notification {
            link,
            handle: fake_handle(characteristic),
            value,
        });
    }

    /// Drops the current link and reports it.
    pub fn drop_link(&self) {
        let link = self.sever_link();
        let _ = self.events.send(TransportEvent::LinkLost { link });
    }

    /// Drops the current link without reporting it; later primitives fail with `NotConnected`.
    pub fn sever_link(&self) -> LinkTag {
        let mut state = self.lock();
        state.connected = false;
        state.link
    }

    /// Delivers an arbitrary event, e.g. one tagged with an earlier link.
    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the call log from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, device: &DeviceIdentifier, link: LinkTag) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Connect(device.clone()));
        let outcome = state.connect_outcomes.pop_front().unwrap_or(Ok(()));
        state.connected = outcome.is_ok();
        if outcome.is_ok() {
            state.link = link;
        }
        outcome
    }

    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        self.record(TransportCall::DiscoverServices);
        self.discovery_gate.pass().await?;
        let state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(state.services.clone())
    }

    async fn read(&self, handle: CharacteristicHandle) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Read(handle));
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state
            .values
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))
    }

    async fn write(
        &self,
        handle: CharacteristicHandle,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Write(handle, payload.to_vec()));
        self.write_gate.pass().await?;
        if !self.lock().connected {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn enable_notifications(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::EnableNotifications(handle));
        self.notify_gate.pass().await?;
        let state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.notify_failures.contains(&handle) {
            return Err(TransportError::Failed("CCCD write rejected".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        if let Some(delay) = self.disconnect_delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().connected = false;
        Ok(())
    }
}
