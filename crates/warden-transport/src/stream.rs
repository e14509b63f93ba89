//! Stream sessions.
//!
//! The driver keeps one queue per active stream id ([`StreamSessions`]);
//! the consumer holds the matching [`EventStream`]. The queue exists before
//! the initiating request is posted, so early events are buffered rather
//! than lost. `EventStream` is not `Clone`, so there is exactly one consumer
//! per session.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;
use warden_core::{RequestId, StreamEvent};

use crate::client::Command;
use crate::errors::CallError;

/// Item yielded by an [`EventStream`].
pub type StreamItem = Result<StreamEvent, CallError>;

pub(crate) type EventSender = mpsc::UnboundedSender<StreamItem>;

/// Active stream queues, keyed by stream id.
#[derive(Debug, Default)]
pub(crate) struct StreamSessions {
    sessions: HashMap<RequestId, EventSender>,
}

impl StreamSessions {
    pub(crate) fn insert(&mut self, id: RequestId, events: EventSender) {
        let _ = self.sessions.insert(id, events);
    }

    pub(crate) fn remove(&mut self, id: &RequestId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Queue `item` for stream `id`, closing the session when `last` is set.
    /// Returns false for unknown (finished or aborted) ids.
    pub(crate) fn deliver(&mut self, id: &RequestId, item: StreamItem, last: bool) -> bool {
        let Some(events) = self.sessions.get(id) else {
            return false;
        };
        if events.send(item).is_err() {
            // consumer dropped without aborting
            debug!(%id, "stream consumer gone");
            let _ = self.sessions.remove(id);
            return true;
        }
        if last {
            let _ = self.sessions.remove(id);
        }
        true
    }

    /// Terminate every session with `err`.
    pub(crate) fn fail_all(&mut self, err: &CallError) -> usize {
        let count = self.sessions.len();
        for (_, events) in self.sessions.drain() {
            let _ = events.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Single-consumer sequence of events for one streaming call.
///
/// Yields events in arrival order and ends after a terminal event
/// (`final` or `error`) or an `Err` item. Dropping an unfinished stream
/// aborts it.
#[derive(Debug)]
pub struct EventStream {
    id: RequestId,
    events: mpsc::UnboundedReceiver<StreamItem>,
    commands: mpsc::UnboundedSender<Command>,
    terminal: bool,
}

impl EventStream {
    pub(crate) fn new(
        id: RequestId,
        events: mpsc::UnboundedReceiver<StreamItem>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            commands,
            terminal: false,
        }
    }

    /// Stream id (the correlation id of the initiating request).
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Whether the stream has ended.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Stop consuming: discards anything queued, tells the arbiter to stop
    /// producing, and ends the sequence. Events arriving afterwards are
    /// ignored.
    pub fn abort(&mut self) {
        if self.terminal {
            return;
        }
        self.terminal = true;
        self.events.close();
        while self.events.try_recv().is_ok() {}
        let _ = self.commands.send(Command::Abort(self.id.clone()));
    }

    /// Drain the stream and return the output of its `final` event.
    pub async fn final_output(mut self) -> Result<serde_json::Value, CallError> {
        use futures::StreamExt;

        while let Some(item) = self.next().await {
            match item? {
                StreamEvent::Final { output } => return Ok(output),
                StreamEvent::Error { error } => return Err(CallError::Remote(error)),
                _ => {}
            }
        }
        Err(CallError::ConnectionLost)
    }
}

impl Stream for EventStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        if self.terminal {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                let ends = match &item {
                    Ok(event) => event.is_terminal(),
                    Err(_) => true,
                };
                if ends {
                    self.terminal = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.terminal = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.terminal {
            let _ = self.commands.send(Command::Abort(self.id.clone()));
        }
    }
}
