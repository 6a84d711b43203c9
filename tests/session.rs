use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::time::timeout;

use pixl_bridge_lib::config::SessionConfig;
use pixl_bridge_lib::core::bluetooth::fake::{fake_handle, pixl_services};
use pixl_bridge_lib::core::bluetooth::{
    Action, Characteristic, DateTime, DecodedValue, DeviceIdentifier, DiscoveredService,
    FakeTransport, FixedClock, SessionEvent, SessionHandle, SessionManager, SessionSnapshot,
    SessionState, TransportCall, TransportEvent, UUID_CLICK_COUNTER_CHAR,
};
use pixl_bridge_lib::{SessionError, TransportError};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    transport: Arc<FakeTransport>,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Harness {
    fn start(parts: (FakeTransport, mpsc::UnboundedReceiver<TransportEvent>)) -> Self {
        Self::start_with_retry_delay(parts, 10)
    }

    fn start_with_retry_delay(
        (transport, transport_events): (FakeTransport, mpsc::UnboundedReceiver<TransportEvent>),
        retry_delay_ms: u64,
    ) -> Self {
        let transport = Arc::new(transport);
        let config = SessionConfig {
            connect_retry_delay_ms: retry_delay_ms,
            ..SessionConfig::default()
        };
        let clock = FixedClock(
            NaiveDate::from_ymd_opt(2026, 10, 18)
                .unwrap()
                .and_hms_opt(23, 59, 7)
                .unwrap(),
        );
        let (handle, events) =
            SessionManager::spawn(transport.clone(), transport_events, config, Arc::new(clock));
        Self {
            transport,
            handle,
            events,
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("session event stream closed")
    }

    /// Collects events up to and including the transition into `state`.
    async fn until_state(&mut self, state: SessionState) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = event == SessionEvent::StateChanged(state);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn connect_ready(&mut self) {
        assert!(self.handle.connect(device()).await);
        self.until_state(SessionState::Ready).await;
    }

    async fn wait_for_snapshot(&self, condition: impl Fn(&SessionSnapshot) -> bool) {
        timeout(WAIT, async {
            while !condition(&self.handle.snapshot().await) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached the expected snapshot");
    }

    fn connect_calls(&self) -> usize {
        self.transport
            .calls()
            .iter()
            .filter(|call| matches!(call, TransportCall::Connect(_)))
            .count()
    }

    async fn eventually_called(&self, call: TransportCall) {
        timeout(WAIT, async {
            while !self.transport.calls().contains(&call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{:?} was never called", call));
    }
}

fn device() -> DeviceIdentifier {
    DeviceIdentifier::new("hci0/dev_C4_7C_8D_6A_3E_01")
}

fn unsupported_services() -> Vec<DiscoveredService> {
    let mut services = pixl_services();
    for service in &mut services {
        service
            .characteristics
            .retain(|c| c.uuid != UUID_CLICK_COUNTER_CHAR);
    }
    services
}

fn failures(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SessionEvent::OperationFailed { .. }))
        .count()
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_connect_reaches_ready_and_writes_integer() {
    let mut h = Harness::start(FakeTransport::new());

    assert!(h.handle.connect(device()).await);
    let events = h.until_state(SessionState::Ready).await;
    assert_eq!(
        states(&events),
        vec![
            SessionState::Connecting,
            SessionState::Discovering,
            SessionState::Arming,
            SessionState::Ready,
        ]
    );

    let result = h.handle.perform(Action::SendInt(42)).await;
    assert_eq!(result, Ok(None));

    assert_eq!(
        h.transport.calls(),
        vec![
            TransportCall::Connect(device()),
            TransportCall::DiscoverServices,
            TransportCall::EnableNotifications(fake_handle(Characteristic::ClickCounter)),
            TransportCall::EnableNotifications(fake_handle(Characteristic::CurrentTime)),
            TransportCall::Write(fake_handle(Characteristic::Integer), vec![0x2A, 0, 0, 0]),
        ]
    );

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Ready);
    assert!(snapshot.registry_resolved);
    assert_eq!(snapshot.device, Some(device()));
    assert_eq!(snapshot.pending, 0);
}

#[tokio::test]
async fn test_update_datetime_writes_local_clock() {
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;

    assert_eq!(h.handle.perform(Action::UpdateDatetime).await, Ok(None));
    assert!(h.transport.calls().contains(&TransportCall::Write(
        fake_handle(Characteristic::CurrentTime),
        vec![0xEA, 0x07, 10, 18, 23, 59, 7],
    )));
}

#[tokio::test]
async fn test_connect_is_ignored_while_session_active() {
    let mut h = Harness::start(FakeTransport::new());

    assert!(h.handle.connect(device()).await);
    assert!(!h.handle.connect(DeviceIdentifier::new("other")).await);

    h.until_state(SessionState::Ready).await;
    assert!(!h.handle.connect(device()).await);

    let connects = h
        .transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, TransportCall::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn test_actions_rejected_before_ready() {
    let (transport, rx) = FakeTransport::new();
    // The first attempt fails so the session stays in Connecting for the retry delay
    let transport =
        transport.with_connect_outcomes(vec![Err(TransportError::Failed("busy".to_string()))]);
    let mut h = Harness::start_with_retry_delay((transport, rx), 300);

    assert!(!h.handle.read_temperature().await);
    assert!(!h.handle.disconnect().await);

    assert!(h.handle.connect(device()).await);
    assert!(!h.handle.read_temperature().await);
    assert!(!h.handle.send_int(7).await);
    assert!(!h.handle.update_datetime().await);

    let rejected = h.handle.perform(Action::ReadTemperature).await;
    assert!(matches!(rejected, Err(SessionError::OperationRejected(_))));

    h.until_state(SessionState::Ready).await;
    assert!(
        !h.transport
            .calls()
            .iter()
            .any(|call| matches!(call, TransportCall::Read(_) | TransportCall::Write(..)))
    );
}

#[tokio::test]
async fn test_missing_click_counter_is_unsupported() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_services(unsupported_services()), rx));

    assert!(h.handle.connect(device()).await);
    let events = h.until_state(SessionState::Idle).await;
    assert!(events.contains(&SessionEvent::UnsupportedDevice));
    assert!(!states(&events).contains(&SessionState::Arming));

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(!snapshot.registry_resolved);
    assert_eq!(snapshot.in_flight, None);
    assert_eq!(snapshot.pending, 0);

    assert!(!h.handle.read_temperature().await);
    h.eventually_called(TransportCall::Disconnect).await;
}

#[tokio::test]
async fn test_link_loss_fails_queued_operations() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_writes(), rx));
    h.connect_ready().await;

    let mut waiters = Vec::new();
    for value in [1, 2, 3] {
        let handle = h.handle.clone();
        waiters.push(tokio::spawn(async move {
            handle.perform(Action::SendInt(value)).await
        }));
    }

    // One write blocks at the transport, the other two stay queued
    timeout(WAIT, async {
        loop {
            let snapshot = h.handle.snapshot().await;
            if snapshot.in_flight.is_some() && snapshot.pending == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("writes were never queued");

    h.transport.drop_link();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Err(SessionError::LinkLost));
    }

    let events = h.until_state(SessionState::Idle).await;
    let failures = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                SessionEvent::OperationFailed {
                    error: SessionError::LinkLost,
                    ..
                }
            )
        })
        .count();
    assert_eq!(failures, 3);

    let snapshot = h.handle.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.pending, 0);
    assert!(!h.handle.send_int(4).await);
}

#[tokio::test]
async fn test_connect_retried_once_then_fails() {
    let (transport, rx) = FakeTransport::new();
    let transport = transport.with_connect_outcomes(vec![
        Err(TransportError::Failed("first".to_string())),
        Err(TransportError::Failed("second".to_string())),
    ]);
    let mut h = Harness::start((transport, rx));

    assert!(h.handle.connect(device()).await);
    let events = h.until_state(SessionState::Idle).await;
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::ConnectFailed(SessionError::ConnectFailed(_))
    )));
    assert_eq!(
        h.transport.calls(),
        vec![TransportCall::Connect(device()), TransportCall::Connect(device())]
    );

    // A fresh connect starts a new session
    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Ready).await;
}

#[tokio::test]
async fn test_connect_succeeds_on_retry() {
    let (transport, rx) = FakeTransport::new();
    let transport =
        transport.with_connect_outcomes(vec![Err(TransportError::Failed("busy".to_string()))]);
    let mut h = Harness::start((transport, rx));

    assert!(h.handle.connect(device()).await);
    let events = h.until_state(SessionState::Ready).await;
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, SessionEvent::ConnectFailed(_)))
    );
}

#[tokio::test]
async fn test_unavailable_transport_is_not_retried() {
    let (transport, rx) = FakeTransport::new();
    let transport = transport.with_connect_outcomes(vec![Err(TransportError::Unavailable)]);
    let mut h = Harness::start((transport, rx));

    assert!(h.handle.connect(device()).await);
    let events = h.until_state(SessionState::Idle).await;
    assert!(events.contains(&SessionEvent::ConnectFailed(
        SessionError::TransportUnavailable
    )));
    assert_eq!(h.transport.calls(), vec![TransportCall::Connect(device())]);
}

#[tokio::test]
async fn test_notify_failure_still_reaches_ready() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_notify_failure(Characteristic::ClickCounter), rx));

    h.connect_ready().await;
    assert_eq!(h.handle.state().await, SessionState::Ready);
    assert_eq!(h.handle.perform(Action::SendInt(-1)).await, Ok(None));
    assert!(h.transport.calls().contains(&TransportCall::EnableNotifications(
        fake_handle(Characteristic::CurrentTime)
    )));
}

#[tokio::test]
async fn test_notifications_are_decoded() {
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;

    h.transport
        .notify(Characteristic::Temperature, vec![0xE1, 0x00]);
    h.transport.notify(Characteristic::ClickCounter, vec![3, 4]);
    h.transport.notify(Characteristic::ClickCounter, vec![7]);
    h.transport.notify(
        Characteristic::CurrentTime,
        vec![0xE9, 0x07, 1, 2, 3, 4, 5, 0xFF],
    );

    assert_eq!(h.next_event().await, SessionEvent::TemperatureUpdated(225));
    // The two-byte click counter is dropped
    assert_eq!(h.next_event().await, SessionEvent::ClickCountUpdated(7));
    assert_eq!(
        h.next_event().await,
        SessionEvent::DatetimeUpdated(DateTime {
            year: 2025,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 5,
        })
    );
}

#[tokio::test]
async fn test_perform_read_temperature() {
    let (transport, rx) = FakeTransport::new();
    let transport = transport.with_value(Characteristic::Temperature, vec![0x64, 0x00]);
    let mut h = Harness::start((transport, rx));
    h.connect_ready().await;

    let value = h.handle.perform(Action::ReadTemperature).await;
    assert_eq!(value, Ok(Some(DecodedValue::Temperature(100))));
    assert_eq!(h.next_event().await, SessionEvent::TemperatureUpdated(100));
}

#[tokio::test]
async fn test_failed_read_reports_operation_failure() {
    // No value configured, so the fake rejects the read
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;

    let result = h.handle.perform(Action::ReadTemperature).await;
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert!(matches!(
        h.next_event().await,
        SessionEvent::OperationFailed { .. }
    ));
    assert_eq!(h.handle.state().await, SessionState::Ready);
}

#[tokio::test]
async fn test_disconnect_returns_to_idle() {
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;
    assert!(h.transport.is_connected());

    assert!(h.handle.disconnect().await);
    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(
        states(&events),
        vec![SessionState::Disconnecting, SessionState::Idle]
    );
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));
    assert!(!h.transport.is_connected());

    assert!(!h.handle.disconnect().await);
    assert!(!h.handle.read_temperature().await);
    assert_eq!(h.handle.snapshot().await.device, None);
}

#[tokio::test]
async fn test_disconnect_cancels_queued_operations() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_writes(), rx));
    h.connect_ready().await;

    let first = {
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.perform(Action::SendInt(1)).await })
    };
    h.eventually_called(TransportCall::Write(
        fake_handle(Characteristic::Integer),
        vec![1, 0, 0, 0],
    ))
    .await;
    let second = {
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.perform(Action::SendInt(2)).await })
    };
    timeout(WAIT, async {
        while h.handle.snapshot().await.pending != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second write was never queued");

    assert!(h.handle.disconnect().await);
    assert_eq!(second.await.unwrap(), Err(SessionError::LinkLost));

    // The in-flight write settles before the transport disconnect runs
    h.transport.release_writes(1);
    assert_eq!(first.await.unwrap(), Ok(None));
    h.until_state(SessionState::Idle).await;
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));
}

#[tokio::test]
async fn test_write_on_dead_link_retires_session() {
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;

    // The link is gone but the transport has not reported it yet
    h.transport.sever_link();
    assert_eq!(
        h.handle.perform(Action::SendInt(1)).await,
        Err(SessionError::LinkLost)
    );

    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(failures(&events), 1);
    assert_eq!(h.handle.state().await, SessionState::Idle);
    assert!(!h.handle.send_int(2).await);
}

#[tokio::test]
async fn test_read_on_dead_link_retires_session() {
    let (transport, rx) = FakeTransport::new();
    let transport = transport.with_value(Characteristic::Temperature, vec![0x64, 0x00]);
    let mut h = Harness::start((transport, rx));
    h.connect_ready().await;

    h.transport.sever_link();
    assert_eq!(
        h.handle.perform(Action::ReadTemperature).await,
        Err(SessionError::LinkLost)
    );
    h.until_state(SessionState::Idle).await;
    assert_eq!(h.handle.snapshot().await, SessionSnapshot::idle());
}

#[tokio::test]
async fn test_notify_enable_on_dead_link_retires_session() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_notifications(), rx));

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Arming).await;
    h.transport.sever_link();
    h.transport.release_notifications(2);

    let events = h.until_state(SessionState::Idle).await;
    assert!(!states(&events).contains(&SessionState::Ready));
    // The CurrentTime enable behind it is cancelled
    assert_eq!(failures(&events), 1);
}

#[tokio::test]
async fn test_unsupported_device_releases_link_before_next_connect() {
    let (transport, rx) = FakeTransport::new();
    let transport = transport
        .with_services(unsupported_services())
        .with_disconnect_delay(Duration::from_millis(50));
    let mut h = Harness::start((transport, rx));

    assert!(h.handle.connect(device()).await);
    while h.next_event().await != SessionEvent::UnsupportedDevice {}

    // The disconnect is still running, so the session is not released yet
    assert_eq!(h.handle.state().await, SessionState::Disconnecting);
    assert!(!h.handle.connect(device()).await);
    h.until_state(SessionState::Idle).await;
    assert!(!h.transport.is_connected());

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Idle).await;
    assert_eq!(
        h.transport.calls(),
        vec![
            TransportCall::Connect(device()),
            TransportCall::DiscoverServices,
            TransportCall::Disconnect,
            TransportCall::Connect(device()),
            TransportCall::DiscoverServices,
            TransportCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_events_from_earlier_link_are_dropped() {
    let mut h = Harness::start(FakeTransport::new());
    h.connect_ready().await;
    assert!(h.handle.disconnect().await);
    h.until_state(SessionState::Idle).await;

    h.connect_ready().await;
    h.transport.inject(TransportEvent::LinkLost { link: 1 });
    h.transport.inject(TransportEvent::Notification {
        link: 1,
        handle: fake_handle(Characteristic::Temperature),
        value: vec![0x01, 0x00],
    });
    h.transport
        .notify(Characteristic::Temperature, vec![0xE1, 0x00]);

    assert_eq!(h.next_event().await, SessionEvent::TemperatureUpdated(225));
    assert_eq!(h.handle.state().await, SessionState::Ready);
}

#[tokio::test]
async fn test_link_loss_while_connecting_stops_retry() {
    let (transport, rx) = FakeTransport::new();
    let transport =
        transport.with_connect_outcomes(vec![Err(TransportError::Failed("busy".to_string()))]);
    let mut h = Harness::start_with_retry_delay((transport, rx), 200);

    assert!(h.handle.connect(device()).await);
    h.wait_for_snapshot(|s| s.state == SessionState::Connecting && s.in_flight.is_none())
        .await;

    h.transport.inject(TransportEvent::LinkLost { link: 1 });
    h.until_state(SessionState::Idle).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.connect_calls(), 1);
    assert_eq!(h.handle.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_link_loss_while_discovering() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_discovery(), rx));

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Discovering).await;
    h.transport.drop_link();
    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(states(&events), vec![SessionState::Idle]);

    // The late discovery result belongs to a retired session
    h.transport.release_discovery(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.state().await, SessionState::Idle);
    assert!(
        !h.transport
            .calls()
            .iter()
            .any(|call| matches!(call, TransportCall::EnableNotifications(_)))
    );
}

#[tokio::test]
async fn test_link_loss_while_arming() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_notifications(), rx));

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Arming).await;
    h.transport.drop_link();

    let events = h.until_state(SessionState::Idle).await;
    assert!(!states(&events).contains(&SessionState::Ready));
    // Both notify-enables fail, the in-flight one and the queued one
    assert_eq!(failures(&events), 2);
    assert_eq!(h.handle.snapshot().await, SessionSnapshot::idle());
}

#[tokio::test]
async fn test_disconnect_while_discovering_waits_for_discovery() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_discovery(), rx));

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Discovering).await;
    assert!(h.handle.disconnect().await);
    assert_eq!(
        h.next_event().await,
        SessionEvent::StateChanged(SessionState::Disconnecting)
    );
    assert!(!h.transport.calls().contains(&TransportCall::Disconnect));

    h.transport.release_discovery(1);
    let events = h.until_state(SessionState::Idle).await;
    assert!(!states(&events).contains(&SessionState::Arming));
    assert_eq!(
        h.transport.calls(),
        vec![
            TransportCall::Connect(device()),
            TransportCall::DiscoverServices,
            TransportCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_disconnect_while_arming_discards_late_enable() {
    let (transport, rx) = FakeTransport::new();
    let mut h = Harness::start((transport.with_gated_notifications(), rx));

    assert!(h.handle.connect(device()).await);
    h.until_state(SessionState::Arming).await;
    assert!(h.handle.disconnect().await);

    h.transport.release_notifications(1);
    let events = h.until_state(SessionState::Idle).await;
    assert_eq!(
        states(&events),
        vec![SessionState::Disconnecting, SessionState::Idle]
    );
    // The queued CurrentTime enable is cancelled
    assert_eq!(failures(&events), 1);
    assert_eq!(
        h.transport.calls(),
        vec![
            TransportCall::Connect(device()),
            TransportCall::DiscoverServices,
            TransportCall::EnableNotifications(fake_handle(Characteristic::ClickCounter)),
            TransportCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_disconnect_during_retry_delay_cancels_retry() {
    let (transport, rx) = FakeTransport::new();
    let transport =
        transport.with_connect_outcomes(vec![Err(TransportError::Failed("busy".to_string()))]);
    let mut h = Harness::start_with_retry_delay((transport, rx), 200);

    assert!(h.handle.connect(device()).await);
    h.wait_for_snapshot(|s| s.state == SessionState::Connecting && s.in_flight.is_none())
        .await;

    assert!(h.handle.disconnect().await);
    h.until_state(SessionState::Idle).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.connect_calls(), 1);
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));
    assert_eq!(h.handle.state().await, SessionState::Idle);
}
