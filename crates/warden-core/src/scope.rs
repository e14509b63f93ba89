//! Capability scopes: the closed set of independently grantable capabilities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version of the scope set below. Bumped whenever a scope is added or
/// removed so persisted grants can be migrated.
pub const SCOPE_SET_VERSION: u32 = 1;

/// One grantable capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityScope {
    /// Prompt a language model for text.
    GenerateText,
    /// Enumerate tools exposed by connected tool servers.
    ListTools,
    /// Invoke a tool on a connected tool server.
    ToolCall,
    /// Read the content of the active page.
    BrowserRead,
    /// Click, fill, and scroll on the active page.
    BrowserInteract,
    /// Capture a screenshot of the active page.
    BrowserScreenshot,
    /// Exchange messages with other agents.
    AgentMessaging,
    /// Fetch arbitrary URLs through the arbiter.
    WebFetch,
}

impl CapabilityScope {
    /// Every scope, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::GenerateText,
        Self::ListTools,
        Self::ToolCall,
        Self::BrowserRead,
        Self::BrowserInteract,
        Self::BrowserScreenshot,
        Self::AgentMessaging,
        Self::WebFetch,
    ];

    /// Wire token for this scope.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenerateText => "generate-text",
            Self::ListTools => "list-tools",
            Self::ToolCall => "tool-call",
            Self::BrowserRead => "browser-read",
            Self::BrowserInteract => "browser-interact",
            Self::BrowserScreenshot => "browser-screenshot",
            Self::AgentMessaging => "agent-messaging",
            Self::WebFetch => "web-fetch",
        }
    }
}

impl fmt::Display for CapabilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a scope token is not part of the current set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability scope: {0}")]
pub struct UnknownScope(pub String);

impl FromStr for CapabilityScope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| UnknownScope(s.to_owned()))
    }
}
