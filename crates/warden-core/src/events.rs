//! Stream events: the discriminated union carried by `streamEvent` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ErrorBody;

/// One event emitted by a streaming capability.
///
/// Serialized with a `type` discriminator in `snake_case`, e.g.
/// `{"type": "tool_call", "tool": "srv/search", "args": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Progress notice.
    Status {
        /// Human-readable status line.
        message: String,
    },
    /// Incremental text output.
    Token {
        /// Text fragment.
        text: String,
    },
    /// The producer is invoking a tool.
    ToolCall {
        /// Tool identifier (`server/tool`).
        tool: String,
        /// Tool arguments.
        #[serde(default)]
        args: Value,
    },
    /// A tool invocation finished.
    ToolResult {
        /// Tool identifier (`server/tool`).
        tool: String,
        /// Tool output.
        #[serde(default)]
        result: Value,
        /// Whether the tool reported failure.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Terminal: the stream completed successfully.
    Final {
        /// Final output.
        #[serde(default)]
        output: Value,
    },
    /// Terminal: the stream failed.
    Error {
        /// Failure description.
        error: ErrorBody,
    },
}

impl StreamEvent {
    /// Whether this event ends its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    /// Wire discriminator of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Final { .. } => "final",
            Self::Error { .. } => "error",
        }
    }

    /// Build a status event.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Build a final event.
    pub fn final_output(output: Value) -> Self {
        Self::Final { output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_events() {
        assert!(StreamEvent::final_output(json!(null)).is_terminal());
        assert!(
            StreamEvent::Error {
                error: ErrorBody::new("INTERNAL", "boom"),
            }
            .is_terminal()
        );
        assert!(!StreamEvent::status("thinking").is_terminal());
        assert!(!StreamEvent::Token { text: "a".into() }.is_terminal());
    }

    #[test]
    fn wire_format_tool_call() {
        let raw = r#"{"type": "tool_call", "tool": "srv/search", "args": {"q": "rust"}}"#;
        let ev: StreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.kind(), "tool_call");
        match ev {
            StreamEvent::ToolCall { tool, args } => {
                assert_eq!(tool, "srv/search");
                assert_eq!(args["q"], "rust");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_result_omits_false_error_flag() {
        let ev = StreamEvent::ToolResult {
            tool: "srv/x".into(),
            result: json!("ok"),
            is_error: false,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert!(v.get("is_error").is_none());
    }

    #[test]
    fn final_without_output_defaults_to_null() {
        let ev: StreamEvent = serde_json::from_str(r#"{"type": "final"}"#).unwrap();
        assert_eq!(ev, StreamEvent::final_output(Value::Null));
    }

    #[test]
    fn unknown_event_type_rejected() {
        assert!(serde_json::from_str::<StreamEvent>(r#"{"type": "telepathy"}"#).is_err());
    }
}
