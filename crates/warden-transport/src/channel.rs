//! Typed envelope channels.
//!
//! A channel wraps a transport's sink and source. Outbound envelopes are
//! stamped with the channel tag. Inbound frames are discarded silently when
//! they carry another tag, fail to parse, or come from an unexpected sender
//! on a shared medium.
//!
//! The arbiter end is built with the verified [`Origin`] of its context and
//! attaches that origin to every request it yields.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use warden_core::{
    ArbiterEnvelope, CallerEnvelope, Frame, Origin, RequestEnvelope, RequestId,
};

use crate::adapter::{FrameSink, FrameSource};
use crate::errors::TransportError;

/// Channel parameters shared by both ends.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Tag every frame must carry.
    pub channel_tag: String,
    /// On shared media, the only sender whose frames are accepted.
    pub expected_sender: Option<String>,
}

impl ChannelConfig {
    /// Point-to-point channel with the given tag.
    pub fn new(channel_tag: impl Into<String>) -> Self {
        Self {
            channel_tag: channel_tag.into(),
            expected_sender: None,
        }
    }

    /// Accept frames only from `sender`.
    #[must_use]
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.expected_sender = Some(sender.into());
        self
    }
}

/// Outbound half of a typed channel.
pub struct EnvelopeSender<Out> {
    sink: Arc<dyn FrameSink>,
    tag: Arc<str>,
    _out: PhantomData<fn(Out)>,
}

impl<Out> Clone for EnvelopeSender<Out> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            tag: Arc::clone(&self.tag),
            _out: PhantomData,
        }
    }
}

impl<Out> fmt::Debug for EnvelopeSender<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeSender")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

impl<Out: Serialize> EnvelopeSender<Out> {
    /// Post one envelope. Does not wait for the peer.
    pub fn send(&self, envelope: Out) -> Result<(), TransportError> {
        let frame = Frame::new(self.tag.as_ref(), envelope);
        let text = serde_json::to_string(&frame)?;
        self.sink.send(text)
    }
}

/// Inbound half of a typed channel.
pub struct EnvelopeReceiver<In> {
    source: Box<dyn FrameSource>,
    tag: Arc<str>,
    expected_sender: Option<String>,
    _in: PhantomData<fn() -> In>,
}

impl<In> fmt::Debug for EnvelopeReceiver<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeReceiver")
            .field("tag", &self.tag)
            .field("expected_sender", &self.expected_sender)
            .finish_non_exhaustive()
    }
}

impl<In: DeserializeOwned> EnvelopeReceiver<In> {
    /// Next accepted envelope, or `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<In> {
        loop {
            let frame = self.source.next_frame().await?;
            if let Some(expected) = &self.expected_sender {
                if frame.sender.as_deref() != Some(expected.as_str()) {
                    debug!(sender = ?frame.sender, "discarding frame from unexpected sender");
                    continue;
                }
            }
            let parsed: Frame<In> = match serde_json::from_str(&frame.text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(error = %e, "discarding unparseable frame");
                    continue;
                }
            };
            if parsed.channel_tag != *self.tag {
                debug!(tag = %parsed.channel_tag, "discarding frame with foreign channel tag");
                continue;
            }
            return Some(parsed.envelope);
        }
    }
}

fn split<Out, In>(
    sink: impl FrameSink + 'static,
    source: impl FrameSource + 'static,
    config: ChannelConfig,
) -> (EnvelopeSender<Out>, EnvelopeReceiver<In>) {
    let tag: Arc<str> = Arc::from(config.channel_tag);
    let sender = EnvelopeSender {
        sink: Arc::new(sink),
        tag: Arc::clone(&tag),
        _out: PhantomData,
    };
    let receiver = EnvelopeReceiver {
        source: Box::new(source),
        tag,
        expected_sender: config.expected_sender,
        _in: PhantomData,
    };
    (sender, receiver)
}

/// Caller end: sends requests and aborts, receives responses and events.
pub fn caller_channel(
    sink: impl FrameSink + 'static,
    source: impl FrameSource + 'static,
    config: ChannelConfig,
) -> (EnvelopeSender<CallerEnvelope>, EnvelopeReceiver<ArbiterEnvelope>) {
    split(sink, source, config)
}

/// Arbiter end, bound to the verified origin of the channel's context.
pub fn arbiter_channel(
    sink: impl FrameSink + 'static,
    source: impl FrameSource + 'static,
    config: ChannelConfig,
    origin: Origin,
) -> (EnvelopeSender<ArbiterEnvelope>, ArbiterReceiver) {
    let (sender, inner) = split(sink, source, config);
    (sender, ArbiterReceiver { inner, origin })
}

/// What the arbiter end yields.
#[derive(Clone, Debug, PartialEq)]
pub enum ArbiterInbound {
    /// A request, stamped with the channel's origin.
    Request {
        /// Verified origin of the calling context.
        origin: Origin,
        /// The request as posted.
        request: RequestEnvelope,
    },
    /// Cancellation of an outstanding request.
    Abort(RequestId),
}

/// Inbound half of an arbiter channel.
#[derive(Debug)]
pub struct ArbiterReceiver {
    inner: EnvelopeReceiver<CallerEnvelope>,
    origin: Origin,
}

impl ArbiterReceiver {
    /// Origin every request on this channel is attributed to.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Next inbound envelope, or `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<ArbiterInbound> {
        Some(match self.inner.recv().await? {
            CallerEnvelope::Request(request) => ArbiterInbound::Request {
                origin: self.origin.clone(),
                request,
            },
            CallerEnvelope::Abort(abort) => ArbiterInbound::Abort(abort.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::pipe::duplex;
    use assert_matches::assert_matches;
    use serde_json::json;
    use warden_core::{AbortEnvelope, ResponseEnvelope};

    fn origin() -> Origin {
        Origin::parse("https://a.example").unwrap()
    }

    #[tokio::test]
    async fn request_is_stamped_with_channel_origin() {
        let ((c_tx, c_rx), (a_tx, a_rx)) = duplex();
        let (caller, _caller_rx) = caller_channel(c_tx, c_rx, ChannelConfig::new("warden"));
        let (_arb, mut arb_rx) = arbiter_channel(a_tx, a_rx, ChannelConfig::new("warden"), origin());

        let id = RequestId::from("req_1");
        caller
            .send(CallerEnvelope::Request(RequestEnvelope {
                id: id.clone(),
                capability: "system.ping".into(),
                payload: None,
            }))
            .unwrap();

        assert_matches!(
            arb_rx.recv().await,
            Some(ArbiterInbound::Request { origin: o, request }) if o == origin() && request.id == id
        );
    }

    #[tokio::test]
    async fn smuggled_origin_field_is_ignored() {
        let ((c_tx, _c_rx), (a_tx, a_rx)) = duplex();
        let (_arb, mut arb_rx) = arbiter_channel(a_tx, a_rx, ChannelConfig::new("warden"), origin());
        let raw = json!({
            "channelTag": "warden",
            "kind": "request",
            "id": "req_1",
            "type": "system.ping",
            "origin": "https://evil.example",
        });
        c_tx.send(raw.to_string()).unwrap();
        assert_matches!(
            arb_rx.recv().await,
            Some(ArbiterInbound::Request { origin: o, .. }) if o.as_str() == "https://a.example"
        );
    }

    #[tokio::test]
    async fn foreign_tag_and_garbage_are_discarded() {
        let ((c_tx, c_rx), (a_tx, a_rx)) = duplex();
        let (_caller, mut caller_rx) = caller_channel(c_tx, c_rx, ChannelConfig::new("warden"));
        let foreign = json!({"channelTag": "other", "kind": "response", "id": "req_1", "ok": true});
        let ours = json!({"channelTag": "warden", "kind": "response", "id": "req_2", "ok": true});
        a_tx.send(foreign.to_string()).unwrap();
        a_tx.send("not json".into()).unwrap();
        a_tx.send(json!({"channelTag": "warden", "kind": "mystery"}).to_string()).unwrap();
        a_tx.send(ours.to_string()).unwrap();
        drop(a_tx);
        drop(a_rx);

        let got = caller_rx.recv().await.unwrap();
        assert_eq!(got.id().as_str(), "req_2");
        assert!(caller_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn abort_is_surfaced() {
        let ((c_tx, c_rx), (a_tx, a_rx)) = duplex();
        let (caller, _rx) = caller_channel(c_tx, c_rx, ChannelConfig::new("warden"));
        let (_arb, mut arb_rx) = arbiter_channel(a_tx, a_rx, ChannelConfig::new("warden"), origin());
        caller
            .send(CallerEnvelope::Abort(AbortEnvelope { id: RequestId::from("req_9") }))
            .unwrap();
        assert_matches!(arb_rx.recv().await, Some(ArbiterInbound::Abort(id)) if id.as_str() == "req_9");
    }

    #[tokio::test]
    async fn spoofed_sender_on_bus_is_discarded() {
        let bus = MessageBus::new();
        let (c_sink, c_source) = bus.endpoint("caller");
        let (a_sink, _a_source) = bus.endpoint("arbiter");
        let (mallory_sink, _m_source) = bus.endpoint("mallory");

        let (_caller, mut caller_rx) =
            caller_channel(c_sink, c_source, ChannelConfig::new("warden").from_sender("arbiter"));
        let (mallory, _) =
            arbiter_channel(mallory_sink, crate::pipe::pipe().1, ChannelConfig::new("warden"), origin());
        let (arbiter, _) =
            arbiter_channel(a_sink, crate::pipe::pipe().1, ChannelConfig::new("warden"), origin());

        mallory
            .send(ArbiterEnvelope::Response(ResponseEnvelope::success(
                RequestId::from("req_1"),
                json!("forged"),
            )))
            .unwrap();
        arbiter
            .send(ArbiterEnvelope::Response(ResponseEnvelope::success(
                RequestId::from("req_1"),
                json!("genuine"),
            )))
            .unwrap();

        assert_matches!(
            caller_rx.recv().await,
            Some(ArbiterEnvelope::Response(r)) if r.result == Some(json!("genuine"))
        );
    }
}
