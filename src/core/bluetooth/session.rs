//! Connection session state machine
//! One `ConnectionSession` exists per `connect()` request. It owns the registry and the
//! operation queue, and is only ever mutated from the session manager task: transport
//! completions are sent back as [`Internal`] messages tagged with the session epoch.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use crate::core::bluetooth::codec::{self, Clock};
use crate::core::bluetooth::commands::Action;
use crate::core::bluetooth::queue::{
    Dispatcher, OperationId, OperationKind, OperationQueue, OperationResult,
};
use crate::core::bluetooth::registry::ServiceRegistry;
use crate::core::bluetooth::transport::{Transport, TransportEvent};
use crate::core::bluetooth::types::{
    Characteristic, DeviceIdentifier, DiscoveredService, SessionEvent, SessionSnapshot,
    SessionState,
};
use crate::error::{SessionError, TransportError};

/// Messages produced by tasks spawned on behalf of a session.
#[derive(Debug)]
pub(crate) enum Internal {
    Completed {
        epoch: u64,
        id: OperationId,
        result: OperationResult,
    },
    Discovered {
        epoch: u64,
        result: Result<Vec<DiscoveredService>, TransportError>,
    },
    RetryConnect {
        epoch: u64,
    },
}

impl Internal {
    pub(crate) fn epoch(&self) -> u64 {
        match self {
            Self::Completed { epoch, .. }
            | Self::Discovered { epoch, .. }
            | Self::RetryConnect { epoch } => *epoch,
        }
    }
}

/// Everything a session needs from its manager.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub internal: mpsc::UnboundedSender<Internal>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub clock: Arc<dyn Clock>,
    pub config: SessionConfig,
}

/// Whether the session is still alive after handling an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Retired,
}

/// Runs queue operations on the transport and reports completion to the session task.
struct TransportDispatcher {
    transport: Arc<dyn Transport>,
    internal: mpsc::UnboundedSender<Internal>,
    epoch: u64,
}

impl Dispatcher for TransportDispatcher {
    fn dispatch(&mut self, id: OperationId, kind: &OperationKind) {
        debug!("Dispatching operation #{}: {}", id, kind);
        let transport = self.transport.clone();
        let internal = self.internal.clone();
        let epoch = self.epoch;
        let kind = kind.clone();
        tokio::spawn(async move {
            let result = execute(transport.as_ref(), &kind, epoch).await;
            let _ = internal.send(Internal::Completed { epoch, id, result });
        });
    }
}

/// Runs one operation. The session epoch doubles as the link tag.
async fn execute(transport: &dyn Transport, kind: &OperationKind, epoch: u64) -> OperationResult {
    let result = match kind {
        OperationKind::Connect(device) => transport.connect(device, epoch).await.map(|_| None),
        OperationKind::EnableNotify(_, handle) => {
            transport.enable_notifications(*handle).await.map(|_| None)
        }
        OperationKind::Read(_, handle) => transport.read(*handle).await.map(Some),
        OperationKind::Write(_, handle, payload) => {
            transport.write(*handle, payload).await.map(|_| None)
        }
        OperationKind::Disconnect => transport.disconnect().await.map(|_| None),
    };
    result.map_err(SessionError::from)
}

pub(crate) struct ConnectionSession {
    epoch: u64,
    state: SessionState,
    device: DeviceIdentifier,
    registry: Option<ServiceRegistry>,
    queue: OperationQueue,
    dispatcher: TransportDispatcher,
    ctx: SessionContext,
    retries_left: u32,
    arming_remaining: usize,
    /// A discovery task is running outside the queue
    discovering: bool,
    /// Teardown waits for the running discovery before disconnecting
    disconnect_deferred: bool,
}

impl ConnectionSession {
    /// Creates the session in `Connecting` and enqueues the connect operation.
    pub(crate) fn start(epoch: u64, device: DeviceIdentifier, ctx: SessionContext) -> Self {
        info!("Connecting to {} (session #{})", device, epoch);
        let mut session = Self {
            epoch,
            state: SessionState::Idle,
            device: device.clone(),
            registry: None,
            queue: OperationQueue::new(),
            dispatcher: TransportDispatcher {
                transport: ctx.transport.clone(),
                internal: ctx.internal.clone(),
                epoch,
            },
            retries_left: ctx.config.connect_retries,
            arming_remaining: 0,
            discovering: false,
            disconnect_deferred: false,
            ctx,
        };
        session.set_state(SessionState::Connecting);
        session
            .queue
            .enqueue(OperationKind::Connect(device), None, &mut session.dispatcher);
        session
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            device: Some(self.device.clone()),
            registry_resolved: self.registry.is_some(),
            in_flight: self.queue.in_flight().map(|kind| kind.to_string()),
            pending: self.queue.pending_len(),
        }
    }

    /// Enqueues a user action. Returns `false` unless the session is `Ready`.
    pub(crate) fn submit(
        &mut self,
        action: Action,
        completion: Option<oneshot::Sender<OperationResult>>,
    ) -> bool {
        let Some(registry) = self.registry.filter(|_| self.state == SessionState::Ready) else {
            debug!("Rejecting {:?} in state {:?}", action, self.state);
            return false;
        };
        let kind = match action {
            Action::ReadTemperature => OperationKind::Read(
                Characteristic::Temperature,
                registry.handle(Characteristic::Temperature),
            ),
            Action::SendInt(value) => OperationKind::Write(
                Characteristic::Integer,
                registry.handle(Characteristic::Integer),
                codec::encode_int32(value).to_vec(),
            ),
            Action::UpdateDatetime => OperationKind::Write(
                Characteristic::CurrentTime,
                registry.handle(Characteristic::CurrentTime),
                codec::encode_datetime_now(self.ctx.clock.as_ref()).to_vec(),
            ),
        };
        self.queue.enqueue(kind, completion, &mut self.dispatcher);
        true
    }

    /// Moves to `Disconnecting`. Returns `false` if already there.
    pub(crate) fn request_disconnect(&mut self) -> bool {
        if self.state == SessionState::Disconnecting {
            return false;
        }
        info!("Disconnect requested for {}", self.device);
        self.release_link();
        true
    }

    pub(crate) fn on_internal(&mut self, message: Internal) -> Flow {
        match message {
            Internal::Completed { id, result, .. } => self.on_completed(id, result),
            Internal::Discovered { result, .. } => self.on_discovered(result),
            Internal::RetryConnect { .. } => {
                if self.state == SessionState::Connecting && self.queue.is_empty() {
                    info!("Retrying connection to {}", self.device);
                    self.queue.enqueue(
                        OperationKind::Connect(self.device.clone()),
                        None,
                        &mut self.dispatcher,
                    );
                }
                Flow::Continue
            }
        }
    }

    pub(crate) fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Notification { handle, value, .. } => {
                match self.registry.and_then(|r| r.characteristic_for(handle)) {
                    Some(characteristic) => self.publish(characteristic, &value),
                    None => debug!("Ignoring notification from unresolved handle {}", handle),
                }
                Flow::Continue
            }
            TransportEvent::LinkLost { .. } => {
                warn!("Link to {} lost in state {:?}", self.device, self.state);
                self.retire(SessionError::LinkLost)
            }
        }
    }

    fn on_completed(&mut self, id: OperationId, result: OperationResult) -> Flow {
        let Some(kind) = self.queue.complete(id, result.clone(), &mut self.dispatcher) else {
            return Flow::Continue;
        };
        match (kind, result) {
            (OperationKind::Connect(_), Ok(_)) => {
                if self.state == SessionState::Connecting {
                    info!("Connected to {}, discovering services...", self.device);
                    self.set_state(SessionState::Discovering);
                    self.start_discovery();
                }
                Flow::Continue
            }
            (OperationKind::Connect(_), Err(e)) => self.on_connect_failed(e),
            (OperationKind::EnableNotify(..), Err(SessionError::LinkLost)) => {
                self.retire(SessionError::LinkLost)
            }
            (OperationKind::EnableNotify(characteristic, _), result) => {
                match result {
                    Ok(_) => info!("Notifications enabled for {:?}", characteristic),
                    Err(e) => warn!(
                        "Failed to enable notifications for {:?}: {}",
                        characteristic, e
                    ),
                }
                self.arming_remaining = self.arming_remaining.saturating_sub(1);
                if self.state == SessionState::Arming && self.arming_remaining == 0 {
                    self.set_state(SessionState::Ready);
                }
                Flow::Continue
            }
            (OperationKind::Read(characteristic, _), Ok(value)) => {
                self.publish(characteristic, value.as_deref().unwrap_or_default());
                Flow::Continue
            }
            (OperationKind::Write(characteristic, _, _), Ok(_)) => {
                debug!("Write to {:?} acknowledged", characteristic);
                Flow::Continue
            }
            (kind @ (OperationKind::Read(..) | OperationKind::Write(..)), Err(error)) => {
                warn!("Operation {} failed: {}", kind, error);
                let link_lost = error == SessionError::LinkLost;
                self.emit(SessionEvent::OperationFailed {
                    operation: kind.to_string(),
                    error,
                });
                if link_lost {
                    return self.retire(SessionError::LinkLost);
                }
                Flow::Continue
            }
            (OperationKind::Disconnect, result) => {
                match result {
                    Ok(_) => info!("Disconnected from {}", self.device),
                    Err(e) => warn!("Transport disconnect from {} failed: {}", self.device, e),
                }
                self.retire(SessionError::LinkLost)
            }
        }
    }

    fn on_connect_failed(&mut self, error: SessionError) -> Flow {
        if self.state != SessionState::Connecting {
            return Flow::Continue;
        }
        if error == SessionError::TransportUnavailable {
            error!("Cannot connect to {}: {}", self.device, error);
            self.emit(SessionEvent::ConnectFailed(error.clone()));
            return self.retire(error);
        }
        if self.retries_left > 0 {
            self.retries_left -= 1;
            let delay = self.ctx.config.connect_retry_delay_ms;
            warn!(
                "Connection attempt to {} failed: {}. Retrying in {} ms...",
                self.device, error, delay
            );
            let internal = self.ctx.internal.clone();
            let epoch = self.epoch;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = internal.send(Internal::RetryConnect { epoch });
            });
            return Flow::Continue;
        }
        error!("Failed to connect to {}: {}", self.device, error);
        let reason = SessionError::ConnectFailed(error.to_string());
        self.emit(SessionEvent::ConnectFailed(reason.clone()));
        self.retire(reason)
    }

    fn on_discovered(&mut self, result: Result<Vec<DiscoveredService>, TransportError>) -> Flow {
        self.discovering = false;
        if self.state != SessionState::Discovering {
            debug!("Discarding discovery result in state {:?}", self.state);
            if std::mem::take(&mut self.disconnect_deferred) {
                self.queue
                    .enqueue(OperationKind::Disconnect, None, &mut self.dispatcher);
            }
            return Flow::Continue;
        }
        let services = match result {
            Ok(services) => services,
            Err(TransportError::NotConnected) => {
                error!("Link to {} lost during service discovery", self.device);
                self.emit(SessionEvent::ConnectFailed(SessionError::LinkLost));
                return self.retire(SessionError::LinkLost);
            }
            Err(e) => {
                error!("Service discovery on {} failed: {}", self.device, e);
                self.emit(SessionEvent::ConnectFailed(SessionError::from(e)));
                self.release_link();
                return Flow::Continue;
            }
        };
        match ServiceRegistry::validate(&services) {
            Ok(registry) => {
                self.registry = Some(registry);
                self.set_state(SessionState::Arming);
                self.arming_remaining = 2;
                for characteristic in [Characteristic::ClickCounter, Characteristic::CurrentTime] {
                    self.queue.enqueue(
                        OperationKind::EnableNotify(characteristic, registry.handle(characteristic)),
                        None,
                        &mut self.dispatcher,
                    );
                }
                Flow::Continue
            }
            Err(e) => {
                error!("Device {} not supported: {}", self.device, e);
                self.emit(SessionEvent::UnsupportedDevice);
                self.release_link();
                Flow::Continue
            }
        }
    }

    fn start_discovery(&mut self) {
        self.discovering = true;
        let transport = self.ctx.transport.clone();
        let internal = self.ctx.internal.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = transport.discover_services().await;
            let _ = internal.send(Internal::Discovered { epoch, result });
        });
    }

    /// Enters `Disconnecting`: queued work is cancelled and the registry cleared. The
    /// transport disconnect is queued behind the in-flight operation, or behind a running
    /// discovery. The session retires once it completes.
    fn release_link(&mut self) {
        self.set_state(SessionState::Disconnecting);
        self.registry = None;
        let cancelled = self.queue.cancel_pending(SessionError::LinkLost);
        self.report_cancelled(cancelled, &SessionError::LinkLost);
        if self.discovering {
            self.disconnect_deferred = true;
        } else {
            self.queue
                .enqueue(OperationKind::Disconnect, None, &mut self.dispatcher);
        }
    }

    /// Decodes a value and emits the matching event. Malformed payloads are dropped.
    fn publish(&self, characteristic: Characteristic, value: &[u8]) {
        let event = match characteristic {
            Characteristic::Temperature => {
                codec::decode_temperature(value).map(SessionEvent::TemperatureUpdated)
            }
            Characteristic::ClickCounter => {
                codec::decode_click_count(value).map(SessionEvent::ClickCountUpdated)
            }
            Characteristic::CurrentTime => {
                codec::decode_datetime(value).map(SessionEvent::DatetimeUpdated)
            }
            Characteristic::Integer => {
                debug!("Ignoring value from write-only Integer characteristic");
                return;
            }
        };
        match event {
            Ok(event) => self.emit(event),
            Err(e) => warn!(
                "Dropping malformed {:?} payload {:02x?}: {}",
                characteristic, value, e
            ),
        }
    }

    /// Cancels all work, clears the registry and ends in `Idle`.
    fn retire(&mut self, reason: SessionError) -> Flow {
        let cancelled = self.queue.cancel_all(reason.clone());
        self.report_cancelled(cancelled, &reason);
        self.registry = None;
        self.set_state(SessionState::Idle);
        info!("Session #{} for {} retired", self.epoch, self.device);
        Flow::Retired
    }

    fn report_cancelled(&self, cancelled: Vec<OperationKind>, reason: &SessionError) {
        for kind in cancelled {
            debug!("Cancelled {}: {}", kind, reason);
            self.emit(SessionEvent::OperationFailed {
                operation: kind.to_string(),
                error: reason.clone(),
            });
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("Session state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("No observer attached to the session event stream");
        }
    }
}
