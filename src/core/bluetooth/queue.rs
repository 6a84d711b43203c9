//! Operation queue for a single connection
//! At most one operation is in flight; completions are delivered in enqueue order.

use std::collections::VecDeque;
use std::fmt;

use log::debug;
use tokio::sync::oneshot;

use crate::core::bluetooth::types::{Characteristic, CharacteristicHandle, DeviceIdentifier};
use crate::error::SessionError;

pub type OperationId = u64;

/// Result slot of an operation: the payload of a read, `None` for everything else.
pub type OperationResult = Result<Option<Vec<u8>>, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Connect(DeviceIdentifier),
    EnableNotify(Characteristic, CharacteristicHandle),
    Read(Characteristic, CharacteristicHandle),
    Write(Characteristic, CharacteristicHandle, Vec<u8>),
    Disconnect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(device) => write!(f, "connect({device})"),
            Self::EnableNotify(c, _) => write!(f, "enable_notify({c:?})"),
            Self::Read(c, _) => write!(f, "read({c:?})"),
            Self::Write(c, _, payload) => write!(f, "write({c:?}, {} bytes)", payload.len()),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// A queued unit of work and its continuation.
#[derive(Debug)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    reply: Option<oneshot::Sender<OperationResult>>,
}

impl Operation {
    fn finish(self, result: OperationResult) -> OperationKind {
        if let Some(reply) = self.reply {
            // The requester may have stopped waiting
            let _ = reply.send(result);
        }
        self.kind
    }
}

/// Starts an operation against the transport. Completion is reported back through
/// [`OperationQueue::complete`].
pub trait Dispatcher {
    fn dispatch(&mut self, id: OperationId, kind: &OperationKind);
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    in_flight: Option<Operation>,
    next_id: OperationId,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation and dispatches it right away if nothing is in flight.
    pub fn enqueue<D: Dispatcher + ?Sized>(
        &mut self,
        kind: OperationKind,
        reply: Option<oneshot::Sender<OperationResult>>,
        dispatcher: &mut D,
    ) -> OperationId {
        self.next_id += 1;
        let id = self.next_id;
        debug!("Enqueued operation #{}: {}", id, kind);
        self.pending.push_back(Operation { id, kind, reply });
        self.pump(dispatcher);
        id
    }

    /// Completes the in-flight operation and dispatches the next one.
    /// Returns the finished operation's kind, or `None` if `id` is not in flight.
    pub fn complete<D: Dispatcher + ?Sized>(
        &mut self,
        id: OperationId,
        result: OperationResult,
        dispatcher: &mut D,
    ) -> Option<OperationKind> {
        if self.in_flight.as_ref().map(|op| op.id) != Some(id) {
            debug!("Ignoring completion of operation #{} (not in flight)", id);
            return None;
        }
        let operation = self.in_flight.take()?;
        debug!("Operation #{} completed: {}", id, operation.kind);
        let kind = operation.finish(result);
        self.pump(dispatcher);
        Some(kind)
    }

    /// Fails every operation that has not been dispatched yet. The in-flight one is left alone.
    pub fn cancel_pending(&mut self, reason: SessionError) -> Vec<OperationKind> {
        self.pending
            .drain(..)
            .map(|op| op.finish(Err(reason.clone())))
            .collect()
    }

    /// Fails every operation, the in-flight one first.
    pub fn cancel_all(&mut self, reason: SessionError) -> Vec<OperationKind> {
        let mut cancelled: Vec<OperationKind> = self
            .in_flight
            .take()
            .map(|op| op.finish(Err(reason.clone())))
            .into_iter()
            .collect();
        cancelled.extend(self.cancel_pending(reason));
        cancelled
    }

    pub fn in_flight(&self) -> Option<&OperationKind> {
        self.in_flight.as_ref().map(|op| &op.kind)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    fn pump<D: Dispatcher + ?Sized>(&mut self, dispatcher: &mut D) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(next) = self.pending.pop_front() {
            dispatcher.dispatch(next.id, &next.kind);
            self.in_flight = Some(next);
        }
    }
}
