use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{OcppgError, Result};
use crate::protocol::{ErrorCode, Message};

/// How a gateway-originated Call finished.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The charge point answered with a CallResult
    Result(Value),
    /// The charge point answered with a CallError
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
    /// No reply arrived before the deadline
    Timeout,
    /// The session ended while the request was outstanding
    SessionClosed,
}

impl CallOutcome {
    /// Splits a reply envelope into its message id and outcome. Calls yield `None`.
    pub fn from_reply(msg: Message) -> Option<(String, CallOutcome)> {
        match msg {
            Message::Call { .. } => None,
            Message::CallResult { message_id, payload } => {
                Some((message_id, CallOutcome::Result(payload)))
            }
            Message::CallError { message_id, error_code, error_description, error_details } => Some((
                message_id,
                CallOutcome::Error {
                    code: error_code,
                    description: error_description,
                    details: error_details,
                },
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Result(_))
    }
}

/// A Call the gateway sent and is waiting on.
#[derive(Debug)]
pub struct PendingRequest {
    pub message_id: String,
    pub action: String,
    pub created_at: Instant,
    pub deadline: Instant,
    result_sink: Option<oneshot::Sender<CallOutcome>>,
}

impl PendingRequest {
    // Taking the sink makes a second completion a no-op.
    fn complete(&mut self, outcome: CallOutcome) {
        if let Some(tx) = self.result_sink.take() {
            let _ = tx.send(outcome);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.result_sink.is_none()
    }
}

/// Per-session map of outstanding gateway-originated Calls.
///
/// Every tracked id leaves the table exactly once, through [`resolve`],
/// [`expire_due`] or [`fail_all`], and its waiter is completed on the way
/// out.
///
/// [`resolve`]: CorrelationTable::resolve
/// [`expire_due`]: CorrelationTable::expire_due
/// [`fail_all`]: CorrelationTable::fail_all
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
    /// Ids handed out to queued commands that are not dispatched yet
    reserved: HashSet<String>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh id that collides with no pending or reserved id.
    pub fn allocate_id(&mut self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.pending.contains_key(&id) && !self.reserved.contains(&id) {
                self.reserved.insert(id.clone());
                return id;
            }
        }
    }

    /// Releases a reserved id that will never be dispatched.
    pub fn release(&mut self, message_id: &str) {
        self.reserved.remove(message_id);
    }

    /// Allocates an id and starts tracking a Call under it.
    pub fn track(
        &mut self,
        action: &str,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<CallOutcome>) {
        let message_id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.track_reserved(message_id.clone(), action, timeout, tx);
        (message_id, rx)
    }

    /// Starts tracking a Call under an id previously returned by [`allocate_id`].
    ///
    /// [`allocate_id`]: CorrelationTable::allocate_id
    pub(crate) fn track_reserved(
        &mut self,
        message_id: String,
        action: &str,
        timeout: Duration,
        result_sink: oneshot::Sender<CallOutcome>,
    ) {
        self.reserved.remove(&message_id);
        let now = Instant::now();
        let request = PendingRequest {
            message_id: message_id.clone(),
            action: action.to_string(),
            created_at: now,
            deadline: now + timeout,
            result_sink: Some(result_sink),
        };
        self.pending.insert(message_id, request);
    }

    /// Completes the pending request matching `message_id` with `outcome`.
    pub fn resolve(&mut self, message_id: &str, outcome: CallOutcome) -> Result<PendingRequest> {
        let mut request = self
            .pending
            .remove(message_id)
            .ok_or_else(|| OcppgError::CorrelationMiss(message_id.to_string()))?;
        request.complete(outcome);
        Ok(request)
    }

    /// Completes every request whose deadline is at or before `now` with `Timeout`.
    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingRequest> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(mut request) = self.pending.remove(&id) {
                request.complete(CallOutcome::Timeout);
                expired.push(request);
            }
        }
        expired.sort_by_key(|r| r.deadline);
        expired
    }

    /// Fails everything outstanding with `SessionClosed` and forgets reservations.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, mut request) in self.pending.drain() {
            request.complete(CallOutcome::SessionClosed);
        }
        self.reserved.clear();
        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
