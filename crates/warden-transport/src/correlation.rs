//! Outstanding-call bookkeeping.
//!
//! Owned by a single client driver task; never shared.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use warden_core::RequestId;

use crate::errors::CallError;

/// Continuation of a correlated call.
pub type Reply = oneshot::Sender<Result<Value, CallError>>;

#[derive(Debug)]
struct PendingCall {
    capability: String,
    started: Instant,
    deadline: Instant,
    reply: Reply,
}

/// What happened to an inbound response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Matched a live entry and was handed to the caller.
    Delivered,
    /// Matched an entry whose deadline had already passed; the caller got a
    /// timeout instead.
    Expired,
    /// No entry: the call already timed out, was forgotten, or never existed.
    Unknown,
}

/// Map of request id to pending continuation, one entry per outstanding call.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<RequestId, PendingCall>,
}

impl CorrelationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. A reused id replaces (and thereby cancels) the old
    /// entry.
    pub fn register(&mut self, id: RequestId, capability: impl Into<String>, deadline: Instant, reply: Reply) {
        let previous = self.pending.insert(
            id,
            PendingCall {
                capability: capability.into(),
                started: Instant::now(),
                deadline,
                reply,
            },
        );
        if previous.is_some() {
            debug!("correlation id reused, previous call dropped");
        }
    }

    /// Settle the call `id` with `outcome`, clearing its entry.
    pub fn resolve(&mut self, id: &RequestId, outcome: Result<Value, CallError>, now: Instant) -> Resolution {
        let Some(call) = self.pending.remove(id) else {
            return Resolution::Unknown;
        };
        if now > call.deadline {
            let err = timeout_error(&call);
            let _ = call.reply.send(Err(err));
            return Resolution::Expired;
        }
        // The caller may have stopped waiting; that is not an error here.
        let _ = call.reply.send(outcome);
        Resolution::Delivered
    }

    /// Drop the entry for `id` without settling it.
    pub fn forget(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Reject every entry with `err` and empty the table.
    pub fn reject_all(&mut self, err: &CallError) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            let _ = call.reply.send(Err(err.clone()));
        }
        count
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn timeout_error(call: &PendingCall) -> CallError {
    let waited = call.deadline.saturating_duration_since(call.started);
    CallError::Timeout {
        capability: call.capability.clone(),
        timeout_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
    }
}
