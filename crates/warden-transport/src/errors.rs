//! Transport and call error types.

use serde_json::Value;
use warden_core::errors::{self, ErrorCode};
use warden_core::{CapabilityScope, ErrorBody};

/// Failures of the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer or the local writer is gone.
    #[error("transport closed")]
    Closed,

    /// Envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Frame exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Frame length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// I/O error on a byte-stream transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a failed call or stream, as seen by the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// No response arrived before the deadline. Distinct from any
    /// permission failure: slow is not refused.
    #[error("call '{capability}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Capability identifier.
        capability: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The channel closed while the call was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The arbiter answered with an error (including handler errors,
    /// which pass through unchanged).
    #[error("{}: {}", .0.code, .0.message)]
    Remote(ErrorBody),

    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl CallError {
    /// Wire code of this error.
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => errors::TIMEOUT,
            Self::ConnectionLost => errors::CONNECTION_LOST,
            Self::Remote(body) => &body.code,
            Self::Encode(_) => errors::INVALID_PARAMS,
        }
    }

    /// Typed code, when it belongs to the protocol taxonomy.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::parse(self.code())
    }

    /// Whether the deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether a fresh grant request could make a retry succeed.
    pub fn is_permission_failure(&self) -> bool {
        self.error_code()
            .is_some_and(ErrorCode::is_permission_failure)
    }

    /// Scopes the arbiter reported as missing or denied, for retrying via a
    /// grant request.
    pub fn missing_scopes(&self) -> Vec<CapabilityScope> {
        let Self::Remote(body) = self else {
            return Vec::new();
        };
        let Some(details) = body.details.as_ref() else {
            return Vec::new();
        };
        ["missingScopes", "deniedScopes"]
            .iter()
            .filter_map(|key| details.get(*key).and_then(Value::as_array))
            .flatten()
            .filter_map(|v| v.as_str()?.parse().ok())
            .collect()
    }
}

impl From<ErrorBody> for CallError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote(body)
    }
}
