//! # warden-transport
//!
//! The caller-facing half of the Warden capability protocol, plus the
//! channel plumbing both halves share.
//!
//! - [`adapter`]: the two-method transport seam (`send` / `next_frame`) and
//!   its implementations: an in-page [`bus`], an in-process [`pipe`], and the
//!   length-prefixed [`native`] port
//! - [`channel`]: typed envelope channels that drop foreign, malformed, and
//!   spoofed frames, and stamp arbiter-bound requests with the verified
//!   origin of the channel's context
//! - [`correlation`]: the table of outstanding calls and their deadlines
//! - [`stream`]: stream sessions and the single-consumer [`EventStream`]
//! - [`client`]: [`CapabilityClient`], which owns one correlation table and
//!   one stream session map per channel inside a single driver task

#![deny(unsafe_code)]

pub mod adapter;
pub mod bus;
pub mod channel;
pub mod client;
pub mod correlation;
pub mod errors;
pub mod native;
pub mod pipe;
pub mod stream;

pub use adapter::{FrameSink, FrameSource, InboundFrame};
pub use bus::MessageBus;
pub use channel::{
    ArbiterInbound, ArbiterReceiver, ChannelConfig, EnvelopeReceiver, EnvelopeSender,
    arbiter_channel, caller_channel,
};
pub use client::{CallClass, CallTimeouts, CapabilityClient, ClientConfig, ClientStats};
pub use errors::{CallError, TransportError};
pub use native::{NativeMessagingCodec, native_port};
pub use pipe::{duplex, pipe};
pub use stream::{EventStream, StreamItem};
