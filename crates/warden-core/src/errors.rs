//! Protocol error codes and the arbiter-side error type.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::envelope::ErrorBody;
use crate::scope::CapabilityScope;

// ── Error code constants ────────────────────────────────────────────

/// A required scope has no usable grant.
pub const SCOPE_REQUIRED: &str = "SCOPE_REQUIRED";
/// A required scope was explicitly denied.
pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
/// The tool is not on the origin's allowlist.
pub const TOOL_NOT_ALLOWED: &str = "TOOL_NOT_ALLOWED";
/// The deadline elapsed with no response.
pub const TIMEOUT: &str = "TIMEOUT";
/// Stale or unknown stream/session id.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
/// Unknown capability identifier.
pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
/// Unexpected handler failure.
pub const INTERNAL: &str = "INTERNAL";
/// Malformed payload.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// The channel closed while the call was outstanding.
pub const CONNECTION_LOST: &str = "CONNECTION_LOST";

/// Typed view of the wire error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// See [`SCOPE_REQUIRED`].
    ScopeRequired,
    /// See [`PERMISSION_DENIED`].
    PermissionDenied,
    /// See [`TOOL_NOT_ALLOWED`].
    ToolNotAllowed,
    /// See [`TIMEOUT`].
    Timeout,
    /// See [`SESSION_NOT_FOUND`].
    SessionNotFound,
    /// See [`NOT_IMPLEMENTED`].
    NotImplemented,
    /// See [`INTERNAL`].
    Internal,
    /// See [`INVALID_PARAMS`].
    InvalidParams,
    /// See [`CONNECTION_LOST`].
    ConnectionLost,
}

impl ErrorCode {
    /// Wire string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScopeRequired => SCOPE_REQUIRED,
            Self::PermissionDenied => PERMISSION_DENIED,
            Self::ToolNotAllowed => TOOL_NOT_ALLOWED,
            Self::Timeout => TIMEOUT,
            Self::SessionNotFound => SESSION_NOT_FOUND,
            Self::NotImplemented => NOT_IMPLEMENTED,
            Self::Internal => INTERNAL,
            Self::InvalidParams => INVALID_PARAMS,
            Self::ConnectionLost => CONNECTION_LOST,
        }
    }

    /// Parse a wire string. Codes outside the taxonomy (handler-specific
    /// codes passed through unchanged) return `None`.
    pub fn parse(code: &str) -> Option<Self> {
        serde_json::from_value(Value::String(code.to_owned())).ok()
    }

    /// Whether a fresh grant request could turn this failure into success.
    pub fn is_permission_failure(self) -> bool {
        matches!(
            self,
            Self::ScopeRequired | Self::PermissionDenied | Self::ToolNotAllowed
        )
    }
}

/// Errors produced on the arbiter side while dispatching a capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// One or more required scopes lack a usable grant.
    #[error("missing required scopes: {}", join_scopes(.missing))]
    ScopeRequired {
        /// Scopes that must be granted before retrying.
        missing: Vec<CapabilityScope>,
    },

    /// One or more required scopes were explicitly denied.
    #[error("permission denied for scopes: {}", join_scopes(.denied))]
    PermissionDenied {
        /// Scopes in the `Denied` state.
        denied: Vec<CapabilityScope>,
    },

    /// The tool is not on the origin's allowlist.
    #[error("tool '{tool}' is not allowed for this origin")]
    ToolNotAllowed {
        /// Requested tool identifier.
        tool: String,
        /// The origin's allowlist.
        allowed: Vec<String>,
    },

    /// Stale or unknown session id. The protocol core never raises this;
    /// session-oriented handlers (e.g. `ai.createSession` and its follow-up
    /// calls) return it and the gateway forwards it unchanged.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Unknown capability identifier.
    #[error("capability '{0}' is not implemented")]
    NotImplemented(String),

    /// Malformed payload.
    #[error("{0}")]
    InvalidParams(String),

    /// The handler did not finish in time.
    #[error("{0}")]
    Timeout(String),

    /// Unexpected handler failure.
    #[error("{0}")]
    Internal(String),

    /// Handler-originated error, passed through unchanged.
    #[error("{}", .0.message)]
    Handler(ErrorBody),
}

fn join_scopes(scopes: &[CapabilityScope]) -> String {
    scopes
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ProtocolError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::ScopeRequired { .. } => SCOPE_REQUIRED,
            Self::PermissionDenied { .. } => PERMISSION_DENIED,
            Self::ToolNotAllowed { .. } => TOOL_NOT_ALLOWED,
            Self::SessionNotFound(_) => SESSION_NOT_FOUND,
            Self::NotImplemented(_) => NOT_IMPLEMENTED,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Timeout(_) => TIMEOUT,
            Self::Internal(_) => INTERNAL,
            Self::Handler(body) => &body.code,
        }
    }

    /// Convert to the wire-format error body.
    ///
    /// Permission failures carry enough structure for the caller to retry
    /// through a fresh grant request.
    pub fn to_error_body(&self) -> ErrorBody {
        if let Self::Handler(body) = self {
            return body.clone();
        }
        let details = match self {
            Self::ScopeRequired { missing } => Some(json!({
                "requiredScope": missing.first(),
                "missingScopes": missing,
            })),
            Self::PermissionDenied { denied } => Some(json!({ "deniedScopes": denied })),
            Self::ToolNotAllowed { tool, allowed } => Some(json!({
                "tool": tool,
                "allowedTools": allowed,
            })),
            _ => None,
        };
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<ErrorBody> for ProtocolError {
    fn from(body: ErrorBody) -> Self {
        Self::Handler(body)
    }
}
