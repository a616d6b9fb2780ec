//! Request dispatch state machine
//!
//! Pure bookkeeping with no I/O: every event returns at most one
//! [`Dispatch`], the line the caller must hand to the worker next. The
//! supervisor drives it under a lock so the decision to dispatch and the
//! hand-off to the writer cannot interleave with another event.
//!
//! ```text
//! NotReady --ready--> Idle --dispatch--> Busy --response/timeout--> Idle
//!     \                 \                  \
//!      `-------------- exit ---------------`--> Stopped
//! ```

use crate::errors::{BridgeError, Result};
use crate::framer::WireMessage;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;

pub type ReplySender = oneshot::Sender<Result<Value>>;
pub type ReplyReceiver = oneshot::Receiver<Result<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    NotReady,
    Idle,
    Busy,
    Stopped,
}

/// A request waiting for, or holding, the worker
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub command: String,
    pub line: String,
    pub timeout: Duration,
    reply: ReplySender,
}

impl PendingRequest {
    fn resolve(self, result: Result<Value>) {
        // The caller may have stopped waiting; nothing to do then
        let _ = self.reply.send(result);
    }
}

/// A line that must be written to the worker, plus its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: u64,
    pub command: String,
    pub line: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotReady,
    Ready,
    Stopped,
}

#[derive(Debug)]
pub struct RequestDispatcher {
    phase: Phase,
    next_id: u64,
    prelaunch: VecDeque<PendingRequest>,
    queue: VecDeque<PendingRequest>,
    in_flight: Option<PendingRequest>,
    /// Ids that timed out; their late responses are dropped
    orphans: VecDeque<u64>,
    stop_reason: String,
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self {
            phase: Phase::NotReady,
            next_id: 1,
            prelaunch: VecDeque::new(),
            queue: VecDeque::new(),
            in_flight: None,
            orphans: VecDeque::new(),
            stop_reason: "worker not running".to_string(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        match (self.phase, &self.in_flight) {
            (Phase::NotReady, _) => DispatcherState::NotReady,
            (Phase::Stopped, _) => DispatcherState::Stopped,
            (Phase::Ready, None) => DispatcherState::Idle,
            (Phase::Ready, Some(_)) => DispatcherState::Busy,
        }
    }

    pub fn prelaunch_len(&self) -> usize {
        self.prelaunch.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_id(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|r| r.id)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Accept a command; the receiver completes when the request does
    ///
    /// While stopped the receiver is already resolved with `WorkerExited`.
    pub fn submit(
        &mut self,
        command: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> (ReplyReceiver, Option<Dispatch>) {
        let (reply, receiver) = oneshot::channel();

        if self.phase == Phase::Stopped {
            let _ = reply.send(Err(BridgeError::WorkerExited(self.stop_reason.clone())));
            return (receiver, None);
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut message = payload;
        message.insert("cmd".to_string(), Value::String(command.to_string()));
        message.insert("id".to_string(), Value::from(id));
        let line = match serde_json::to_string(&Value::Object(message)) {
            Ok(line) => line,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return (receiver, None);
            }
        };

        let request = PendingRequest {
            id,
            command: command.to_string(),
            line,
            timeout,
            reply,
        };

        match self.phase {
            Phase::NotReady => {
                tracing::debug!(id, command, "buffering request until worker is ready");
                self.prelaunch.push_back(request);
                (receiver, None)
            }
            _ => {
                self.queue.push_back(request);
                (receiver, self.advance())
            }
        }
    }

    /// Route a decoded worker line
    pub fn on_message(&mut self, message: WireMessage) -> Option<Dispatch> {
        match message {
            WireMessage::Ready => self.on_ready(),
            WireMessage::Response { id, outcome } => self.on_response(id, outcome),
        }
    }

    pub fn on_ready(&mut self) -> Option<Dispatch> {
        match self.phase {
            Phase::NotReady => {
                self.phase = Phase::Ready;
                let buffered = self.prelaunch.len();
                self.queue.extend(self.prelaunch.drain(..));
                tracing::debug!(buffered, "worker ready");
                self.advance()
            }
            Phase::Ready => {
                tracing::warn!("ignoring duplicate readiness signal");
                None
            }
            Phase::Stopped => {
                tracing::warn!("ignoring readiness signal after worker stopped");
                None
            }
        }
    }

    pub fn on_response(
        &mut self,
        id: Option<u64>,
        outcome: std::result::Result<Value, String>,
    ) -> Option<Dispatch> {
        if self.discard_orphan(id) {
            return None;
        }

        let Some(current) = self.in_flight.as_ref() else {
            tracing::warn!(?id, "discarding response with no request in flight");
            return None;
        };
        if let Some(id) = id {
            if id != current.id {
                tracing::warn!(id, expected = current.id, "discarding response for unknown request");
                return None;
            }
        }

        let request = self.in_flight.take()?;
        tracing::debug!(id = request.id, command = %request.command, ok = outcome.is_ok(), "response");
        request.resolve(outcome.map_err(BridgeError::Command));
        self.advance()
    }

    /// An undecodable line fails only the request in flight
    pub fn on_parse_error(&mut self, error: BridgeError) -> Option<Dispatch> {
        match self.in_flight.take() {
            Some(request) => {
                request.resolve(Err(error));
                self.advance()
            }
            None => {
                tracing::warn!(%error, "undecodable worker output with no request in flight");
                None
            }
        }
    }

    /// Deadline for request `id` passed; stale timers are ignored
    pub fn on_timeout(&mut self, id: u64) -> Option<Dispatch> {
        if self.in_flight_id() != Some(id) {
            return None;
        }
        let request = self.in_flight.take()?;
        tracing::warn!(id, command = %request.command, "request timed out");
        self.orphans.push_back(id);
        let error = BridgeError::Timeout {
            command: request.command.clone(),
            after: request.timeout,
        };
        request.resolve(Err(error));
        self.advance()
    }

    /// Worker is gone: reject everything outstanding with `WorkerExited`
    ///
    /// Returns how many requests were rejected.
    pub fn on_exit(&mut self, reason: &str) -> usize {
        self.phase = Phase::Stopped;
        self.stop_reason = reason.to_string();
        self.orphans.clear();

        let pending: Vec<PendingRequest> = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.queue.drain(..))
            .chain(self.prelaunch.drain(..))
            .collect();
        let count = pending.len();
        for request in pending {
            request.resolve(Err(BridgeError::WorkerExited(reason.to_string())));
        }
        count
    }

    /// Accept requests again for a freshly spawned worker
    pub fn restart(&mut self) {
        if self.phase == Phase::Stopped {
            self.phase = Phase::NotReady;
        }
    }

    fn discard_orphan(&mut self, id: Option<u64>) -> bool {
        match id {
            Some(id) => match self.orphans.iter().position(|o| *o == id) {
                Some(index) => {
                    self.orphans.remove(index);
                    tracing::debug!(id, "discarding late response for timed-out request");
                    true
                }
                None => false,
            },
            None => match self.orphans.pop_front() {
                Some(orphan) => {
                    tracing::debug!(id = orphan, "discarding late response for timed-out request");
                    true
                }
                None => false,
            },
        }
    }

    fn advance(&mut self) -> Option<Dispatch> {
        if self.phase != Phase::Ready || self.in_flight.is_some() {
            return None;
        }
        let request = self.queue.pop_front()?;
        let dispatch = Dispatch {
            id: request.id,
            command: request.command.clone(),
            line: request.line.clone(),
            timeout: request.timeout,
        };
        self.in_flight = Some(request);
        Some(dispatch)
    }
}
