//! The handler seam.
//!
//! Handlers are opaque to the gateway: they receive a validated payload
//! together with the verified origin, and return a value or a stream of
//! events. Scope and allowlist checks have already passed when a handler
//! runs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use warden_core::{Origin, ProtocolError, RequestId, StreamEvent};

/// Per-request context handed to a handler.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// Verified origin of the caller.
    pub origin: Origin,
    /// Correlation id of the request.
    pub request_id: RequestId,
    /// Context (connection, tab) once-grants made for this request are
    /// bound to.
    pub context: Option<String>,
    /// Fires when the caller aborts or the channel closes.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Context for `origin` with a fresh request id and no bound context.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            request_id: RequestId::new(),
            context: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind once-grants to `context`.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// What a handler produced.
pub enum HandlerOutput {
    /// Single result, sent as one `response` envelope.
    Value(Value),
    /// Event sequence, sent as `streamEvent` envelopes.
    Stream(BoxStream<'static, StreamEvent>),
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Implemented by every capability handler.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Execute the capability.
    async fn handle(&self, ctx: &CallContext, payload: Option<Value>) -> Result<HandlerOutput, ProtocolError>;
}
