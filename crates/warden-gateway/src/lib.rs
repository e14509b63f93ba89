//! # warden-gateway
//!
//! The arbiter half of the Warden capability protocol.
//!
//! - [`registry`]: capability identifier → required scopes + handler
//! - [`handler`]: the handler seam: a value or a stream of events
//! - [`mediator`]: where permission prompts are shown and answered
//! - [`gateway`]: [`CapabilityGateway`], which enforces scopes and tool
//!   allowlists before a handler runs and serves the built-in
//!   `permissions.*` and `system.ping` capabilities
//! - [`session`]: [`ArbiterSession`], which serves one channel: concurrent
//!   requests, stream pumping, aborts, and context cleanup

#![deny(unsafe_code)]

pub mod gateway;
pub mod handler;
pub mod mediator;
pub mod registry;
pub mod session;

pub use gateway::{
    CapabilityGateway, GatewayConfig, PERMISSIONS_LIST, PERMISSIONS_REQUEST, SYSTEM_PING,
};
pub use handler::{CallContext, CapabilityHandler, HandlerOutput};
pub use mediator::{ChannelMediator, PromptDecision, PromptMediator, PromptRequest, StaticMediator};
pub use registry::{CapabilityRegistry, CapabilitySpec, resolve_tool};
pub use session::ArbiterSession;
