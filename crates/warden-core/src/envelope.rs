//! Wire envelopes.
//!
//! Every message on a channel is a [`Frame`]: a `channelTag` plus one
//! envelope. Envelopes are split by direction into two closed sum types,
//! discriminated by a `kind` field:
//!
//! | Direction | `kind` | Type |
//! |---|---|---|
//! | caller → arbiter | `request` | [`RequestEnvelope`] |
//! | caller → arbiter | `abort` | [`AbortEnvelope`] |
//! | arbiter → caller | `response` | [`ResponseEnvelope`] |
//! | arbiter → caller | `streamEvent` | [`StreamEventEnvelope`] |
//!
//! Envelopes are immutable once built; nothing in this module mutates one
//! after construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::StreamEvent;
use crate::ids::RequestId;

/// A channel-tagged envelope, the unit actually written to a transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    /// Tag identifying the protocol channel; frames with another tag are
    /// not ours and get discarded.
    #[serde(rename = "channelTag")]
    pub channel_tag: String,
    /// The envelope.
    #[serde(flatten)]
    pub envelope: T,
}

impl<T> Frame<T> {
    /// Wrap an envelope with a channel tag.
    pub fn new(channel_tag: impl Into<String>, envelope: T) -> Self {
        Self {
            channel_tag: channel_tag.into(),
            envelope,
        }
    }
}

/// Envelopes sent by the calling (untrusted) side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CallerEnvelope {
    /// Invoke a capability.
    Request(RequestEnvelope),
    /// Stop producing events for a stream.
    Abort(AbortEnvelope),
}

/// Envelopes sent by the arbiter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ArbiterEnvelope {
    /// Single result for a request.
    Response(ResponseEnvelope),
    /// One event of a stream.
    StreamEvent(StreamEventEnvelope),
}

/// Capability invocation.
///
/// Carries no origin: the arbiter's channel attaches the verified origin of
/// its own context. Any `origin` a caller smuggles into the frame is an
/// unknown field and is ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id.
    pub id: RequestId,
    /// Namespaced capability identifier, e.g. `tools.call`.
    #[serde(rename = "type")]
    pub capability: String,
    /// Capability-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Cancellation of a stream, caller → arbiter only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEnvelope {
    /// Id of the stream to stop.
    pub id: RequestId,
}

/// Result of a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoed correlation id.
    pub id: RequestId,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Result payload (present when `ok`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when not `ok`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// One event belonging to a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEventEnvelope {
    /// Id of the stream (the initiating request's id).
    pub id: RequestId,
    /// The event.
    pub event: StreamEvent,
    /// Set on the last event of the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

/// Structured error carried by a failed response or an `error` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `SCOPE_REQUIRED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    /// Build an error body without details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl ResponseEnvelope {
    /// Build a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failure response.
    pub fn failure(id: RequestId, error: ErrorBody) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`. A failure without an error body becomes an
    /// `INTERNAL` error.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                ErrorBody::new(crate::errors::INTERNAL, "response failed without error body")
            }))
        }
    }
}

impl StreamEventEnvelope {
    /// Wrap an event; terminal events are flagged `done`.
    pub fn new(id: RequestId, event: StreamEvent) -> Self {
        let done = event.is_terminal().then_some(true);
        Self { id, event, done }
    }

    /// Whether this envelope ends its stream, either by a terminal event or
    /// an explicit `done` flag.
    pub fn is_terminal(&self) -> bool {
        self.done == Some(true) || self.event.is_terminal()
    }
}

impl CallerEnvelope {
    /// Correlation id of the envelope.
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Request(r) => &r.id,
            Self::Abort(a) => &a.id,
        }
    }
}

impl ArbiterEnvelope {
    /// Correlation id of the envelope.
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Response(r) => &r.id,
            Self::StreamEvent(e) => &e.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_request() {
        let raw = r#"{"channelTag": "warden", "kind": "request", "id": "r1", "type": "tools.call", "payload": {"tool": "srv/x"}}"#;
        let frame: Frame<CallerEnvelope> = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.channel_tag, "warden");
        match frame.envelope {
            CallerEnvelope::Request(req) => {
                assert_eq!(req.id.as_str(), "r1");
                assert_eq!(req.capability, "tools.call");
                assert_eq!(req.payload.unwrap()["tool"], "srv/x");
            }
            CallerEnvelope::Abort(_) => panic!("expected request"),
        }
    }

    #[test]
    fn request_ignores_smuggled_origin() {
        let raw = r#"{"channelTag": "warden", "kind": "request", "id": "r1", "type": "ai.prompt", "origin": "https://bank.example"}"#;
        let frame: Frame<CallerEnvelope> = serde_json::from_str(raw).unwrap();
        let reserialized = serde_json::to_value(&frame).unwrap();
        assert!(reserialized.get("origin").is_none());
    }

    #[test]
    fn request_without_payload_omits_field() {
        let frame = Frame::new(
            "warden",
            CallerEnvelope::Request(RequestEnvelope {
                id: "r2".into(),
                capability: "system.ping".into(),
                payload: None,
            }),
        );
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["kind"], "request");
        assert_eq!(v["type"], "system.ping");
        assert_eq!(v["channelTag"], "warden");
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn wire_format_abort() {
        let raw = r#"{"channelTag": "warden", "kind": "abort", "id": "s1"}"#;
        let frame: Frame<CallerEnvelope> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame.envelope,
            CallerEnvelope::Abort(AbortEnvelope { id: "s1".into() })
        );
    }

    #[test]
    fn wire_format_stream_event() {
        let raw = r#"{"channelTag": "warden", "kind": "streamEvent", "id": "s1", "event": {"type": "final", "output": "done"}, "done": true}"#;
        let frame: Frame<ArbiterEnvelope> = serde_json::from_str(raw).unwrap();
        match frame.envelope {
            ArbiterEnvelope::StreamEvent(ev) => {
                assert!(ev.is_terminal());
                assert_eq!(ev.event, StreamEvent::final_output(json!("done")));
            }
            ArbiterEnvelope::Response(_) => panic!("expected stream event"),
        }
    }

    #[test]
    fn success_response_has_no_error_field() {
        let resp = ResponseEnvelope::success("r1".into(), json!({"text": "hi"}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["ok"], true);
        assert!(v.get("error").is_none());
        assert_eq!(resp.into_result().unwrap()["text"], "hi");
    }

    #[test]
    fn failure_response_into_result() {
        let body = ErrorBody::new("SCOPE_REQUIRED", "missing")
            .with_details(json!({"missingScopes": ["generate-text"]}));
        let resp = ResponseEnvelope::failure("r1".into(), body.clone());
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["ok"], false);
        assert!(v.get("result").is_none());
        assert_eq!(resp.into_result().unwrap_err(), body);
    }

    #[test]
    fn failure_without_body_is_internal() {
        let resp = ResponseEnvelope {
            id: "r1".into(),
            ok: false,
            result: None,
            error: None,
        };
        assert_eq!(resp.into_result().unwrap_err().code, "INTERNAL");
    }

    #[test]
    fn stream_event_envelope_flags_terminal() {
        let ev = StreamEventEnvelope::new("s1".into(), StreamEvent::status("working"));
        assert_eq!(ev.done, None);
        let ev = StreamEventEnvelope::new("s1".into(), StreamEvent::final_output(json!(1)));
        assert_eq!(ev.done, Some(true));
    }

    #[test]
    fn explicit_done_flag_is_terminal() {
        let ev = StreamEventEnvelope {
            id: "s1".into(),
            event: StreamEvent::status("last"),
            done: Some(true),
        };
        assert!(ev.is_terminal());
    }

    #[test]
    fn arbiter_envelope_rejects_caller_kinds() {
        let raw = r#"{"channelTag": "warden", "kind": "request", "id": "r1", "type": "x"}"#;
        assert!(serde_json::from_str::<Frame<ArbiterEnvelope>>(raw).is_err());
    }
}
