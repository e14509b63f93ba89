//! Grants and per-origin records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{CapabilityScope, Origin};

/// Permission state of one `(origin, scope)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantStatus {
    /// No usable grant; a gated call prompts.
    NotGranted,
    /// Refused. Re-requests return this without prompting.
    Denied,
    /// Granted until expiry or until the bound context closes.
    GrantedOnce,
    /// Granted until revoked.
    GrantedAlways,
}

impl GrantStatus {
    /// Whether a gated call may proceed.
    pub fn is_granted(self) -> bool {
        matches!(self, Self::GrantedOnce | Self::GrantedAlways)
    }

    /// Wire token (`not-granted`, `denied`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotGranted => "not-granted",
            Self::Denied => "denied",
            Self::GrantedOnce => "granted-once",
            Self::GrantedAlways => "granted-always",
        }
    }

    /// Parse a wire token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "not-granted" => Some(Self::NotGranted),
            "denied" => Some(Self::Denied),
            "granted-once" => Some(Self::GrantedOnce),
            "granted-always" => Some(Self::GrantedAlways),
            _ => None,
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's answer to a permission prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantDecision {
    /// Grant for the once-grant lifetime.
    AllowOnce,
    /// Grant until revoked.
    AllowAlways,
    /// Refuse.
    Deny,
}

impl GrantDecision {
    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }
}

/// Stored permission for one `(origin, scope)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Stored status.
    pub status: GrantStatus,
    /// When the decision was made.
    pub granted_at: DateTime<Utc>,
    /// When a once-grant lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Context (tab, connection) a once-grant is tied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_context: Option<String>,
}

impl Grant {
    /// Once-grant lasting `ttl` from `now`, optionally tied to a context.
    /// An expiry past the calendar's end collapses to `now`.
    pub fn once(now: DateTime<Utc>, ttl: Duration, bound_context: Option<String>) -> Self {
        Self {
            status: GrantStatus::GrantedOnce,
            granted_at: now,
            expires_at: Some(now.checked_add_signed(ttl).unwrap_or(now)),
            bound_context,
        }
    }

    /// Permanent grant.
    pub fn always(now: DateTime<Utc>) -> Self {
        Self {
            status: GrantStatus::GrantedAlways,
            granted_at: now,
            expires_at: None,
            bound_context: None,
        }
    }

    /// Explicit refusal. Never expires.
    pub fn denied(now: DateTime<Utc>) -> Self {
        Self {
            status: GrantStatus::Denied,
            granted_at: now,
            expires_at: None,
            bound_context: None,
        }
    }

    /// Status as of `now`: a once-grant past its expiry reads as
    /// `NotGranted`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> GrantStatus {
        match (self.status, self.expires_at) {
            (GrantStatus::GrantedOnce, Some(expires)) if now >= expires => GrantStatus::NotGranted,
            (status, _) => status,
        }
    }
}

/// Everything stored for one origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginPermissionRecord {
    /// The origin.
    pub origin: Origin,
    /// One grant per scope; absent scopes are `NotGranted`.
    pub scopes: BTreeMap<CapabilityScope, Grant>,
    /// Tool allowlist. `None` leaves tools unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<BTreeSet<String>>,
}

impl OriginPermissionRecord {
    /// Empty record.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            scopes: BTreeMap::new(),
            allowed_tools: None,
        }
    }

    /// Effective status of `scope` as of `now`.
    pub fn status(&self, scope: CapabilityScope, now: DateTime<Utc>) -> GrantStatus {
        self.scopes
            .get(&scope)
            .map_or(GrantStatus::NotGranted, |g| g.effective_status(now))
    }

    /// Whether `tool` passes the allowlist.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .is_none_or(|allowed| allowed.contains(tool))
    }

    /// Copy without grants that have lapsed by `now`.
    #[must_use]
    pub fn effective(&self, now: DateTime<Utc>) -> Self {
        let scopes = self
            .scopes
            .iter()
            .filter(|(_, g)| g.effective_status(now) != GrantStatus::NotGranted)
            .map(|(s, g)| (*s, g.clone()))
            .collect();
        Self {
            origin: self.origin.clone(),
            scopes,
            allowed_tools: self.allowed_tools.clone(),
        }
    }
}
