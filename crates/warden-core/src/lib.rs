//! # warden-core
//!
//! Foundation types shared by both sides of the Warden capability protocol.
//!
//! - **Envelopes**: the wire unit, split into one closed sum type per
//!   direction ([`CallerEnvelope`], [`ArbiterEnvelope`]) wrapped in a
//!   channel-tagged [`Frame`]
//! - **Stream events**: the [`StreamEvent`] discriminated union carried by
//!   `streamEvent` envelopes
//! - **Scopes**: the closed, versioned [`CapabilityScope`] set
//! - **Branded IDs**: `RequestId`, `PromptId`, `ConnectionId`
//! - **Origins**: the normalized, channel-verified [`Origin`] of a caller
//! - **Errors**: wire error codes and [`ProtocolError`]
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod origin;
pub mod scope;

pub use envelope::{
    AbortEnvelope, ArbiterEnvelope, CallerEnvelope, ErrorBody, Frame, RequestEnvelope,
    ResponseEnvelope, StreamEventEnvelope,
};
pub use errors::{ErrorCode, ProtocolError};
pub use events::StreamEvent;
pub use ids::{ConnectionId, PromptId, RequestId};
pub use origin::Origin;
pub use scope::{CapabilityScope, SCOPE_SET_VERSION};
