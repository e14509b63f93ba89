//! Shared-medium transport.
//!
//! A [`MessageBus`] models a medium every endpoint can post to and read
//! from, like a page's message event target. Each post is stamped with the
//! posting endpoint's id by the bus itself; frame content cannot forge it.
//! Endpoints never see their own posts.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::adapter::{FrameSink, FrameSource, InboundFrame};
use crate::errors::TransportError;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Posted {
    sender: String,
    text: String,
}

/// Broadcast medium shared by several endpoints.
#[derive(Clone, Debug)]
pub struct MessageBus {
    tx: broadcast::Sender<Posted>,
}

/// Posting half of a bus endpoint.
#[derive(Clone, Debug)]
pub struct BusSink {
    id: String,
    tx: broadcast::Sender<Posted>,
}

/// Listening half of a bus endpoint.
#[derive(Debug)]
pub struct BusSource {
    id: String,
    rx: broadcast::Receiver<Posted>,
}

impl MessageBus {
    /// Bus with the default backlog.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus that keeps up to `capacity` undelivered frames per listener.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach an endpoint identified by `id`.
    ///
    /// The source only observes frames posted after this call.
    pub fn endpoint(&self, id: impl Into<String>) -> (BusSink, BusSource) {
        let id = id.into();
        let sink = BusSink {
            id: id.clone(),
            tx: self.tx.clone(),
        };
        let source = BusSource {
            id,
            rx: self.tx.subscribe(),
        };
        (sink, source)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for BusSink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        // No listeners is not an error on a shared medium.
        let _ = self.tx.send(Posted {
            sender: self.id.clone(),
            text,
        });
        Ok(())
    }
}

#[async_trait]
impl FrameSource for BusSource {
    async fn next_frame(&mut self) -> Option<InboundFrame> {
        loop {
            match self.rx.recv().await {
                Ok(posted) if posted.sender == self.id => {}
                Ok(posted) => {
                    return Some(InboundFrame {
                        sender: Some(posted.sender),
                        text: posted.text,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(endpoint = %self.id, skipped, "bus listener lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
