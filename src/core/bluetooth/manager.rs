//! Session manager for the Pixl bridge
//! This module owns the session task: the single execution context in which
//! session state is created, mutated and destroyed.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::core::bluetooth::codec::Clock;
use crate::core::bluetooth::commands::{SessionCommand, SessionHandle};
use crate::core::bluetooth::session::{ConnectionSession, Flow, Internal, SessionContext};
use crate::core::bluetooth::transport::{Transport, TransportEvent};
use crate::core::bluetooth::types::{SessionEvent, SessionSnapshot};

/// Owns at most one `ConnectionSession` and routes commands, completions and
/// transport events into it.
pub struct SessionManager {
    ctx: SessionContext,
    session: Option<ConnectionSession>,
    next_epoch: u64,
}

impl SessionManager {
    /// Spawns the session task and returns the command handle together with
    /// the ordered event stream.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let manager = Self {
            ctx: SessionContext {
                transport,
                internal: internal_tx,
                events: event_tx,
                clock,
                config,
            },
            session: None,
            next_epoch: 0,
        };
        tokio::spawn(manager.run(command_rx, internal_rx, transport_events));
        info!("Session task started.");

        (SessionHandle::new(command_tx), event_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut transport_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!("Transport event channel closed");
                        transport_open = false;
                    }
                },
            }
        }

        info!("All session handles dropped, shutting down session task.");
        if self.session.take().is_some() {
            if let Err(e) = self.ctx.transport.disconnect().await {
                warn!("Disconnect on shutdown failed: {}", e);
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { device, reply } => {
                let accepted = match self.session.as_ref().map(ConnectionSession::state) {
                    Some(state) => {
                        debug!("Ignoring connect to {}: session already {:?}", device, state);
                        false
                    }
                    None => {
                        self.next_epoch += 1;
                        self.session = Some(ConnectionSession::start(
                            self.next_epoch,
                            device,
                            self.ctx.clone(),
                        ));
                        true
                    }
                };
                let _ = reply.send(accepted);
            }
            SessionCommand::Disconnect { reply } => {
                let accepted = self
                    .session
                    .as_mut()
                    .is_some_and(|session| session.request_disconnect());
                let _ = reply.send(accepted);
            }
            SessionCommand::Submit {
                action,
                reply,
                completion,
            } => {
                let accepted = self
                    .session
                    .as_mut()
                    .is_some_and(|session| session.submit(action, completion));
                let _ = reply.send(accepted);
            }
            SessionCommand::Snapshot { reply } => {
                let snapshot = self
                    .session
                    .as_ref()
                    .map_or_else(SessionSnapshot::idle, ConnectionSession::snapshot);
                let _ = reply.send(snapshot);
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {:?}: no active session", message);
            return;
        };
        if session.epoch() != message.epoch() {
            debug!("Dropping stale message from session #{}", message.epoch());
            return;
        }
        let flow = session.on_internal(message);
        self.apply(flow);
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match self.session.as_mut() {
            Some(session) if session.epoch() == event.link() => {
                let flow = session.on_transport_event(event);
                self.apply(flow);
            }
            Some(_) => debug!("Dropping event from an earlier link: {:?}", event),
            None => debug!("Ignoring transport event while idle: {:?}", event),
        }
    }

    fn apply(&mut self, flow: Flow) {
        if flow == Flow::Retired {
            self.session = None;
        }
    }
}
