//! The transport seam.
//!
//! A transport is anything that can post a text frame and deliver inbound
//! text frames in order. Implementations live next to this module ([`bus`],
//! [`pipe`], [`native`]) and in `warden-server` (WebSocket).
//!
//! [`bus`]: crate::bus
//! [`pipe`]: crate::pipe
//! [`native`]: crate::native

use async_trait::async_trait;

use crate::errors::TransportError;

/// Outbound half of a transport.
///
/// `send` is fire-and-forget: it queues the frame and returns without
/// waiting for the peer.
pub trait FrameSink: Send + Sync {
    /// Queue one text frame for delivery.
    fn send(&self, text: String) -> Result<(), TransportError>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame, or `None` once the transport has closed.
    async fn next_frame(&mut self) -> Option<InboundFrame>;
}

/// One inbound text frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    /// Identity of the posting endpoint, for transports that share a medium
    /// between several parties. Point-to-point transports leave it `None`.
    pub sender: Option<String>,
    /// Frame text.
    pub text: String,
}

impl InboundFrame {
    /// Frame from a point-to-point transport.
    pub fn direct(text: impl Into<String>) -> Self {
        Self {
            sender: None,
            text: text.into(),
        }
    }
}
