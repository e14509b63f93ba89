//! The permission state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};
use warden_core::{CapabilityScope, Origin};

use crate::clock::{Clock, SystemClock};
use crate::errors::Result;
use crate::grant::{Grant, GrantDecision, GrantStatus, OriginPermissionRecord};
use crate::memory::MemoryGrantRepository;
use crate::repository::GrantRepository;

/// Partition of a set of required scopes by effective status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeCheck {
    /// `GrantedOnce` or `GrantedAlways`.
    pub granted: Vec<CapabilityScope>,
    /// Explicitly refused.
    pub denied: Vec<CapabilityScope>,
    /// `NotGranted`: these, and only these, may be prompted for.
    pub missing: Vec<CapabilityScope>,
}

impl ScopeCheck {
    /// Whether every required scope is granted.
    pub fn is_satisfied(&self) -> bool {
        self.denied.is_empty() && self.missing.is_empty()
    }
}

/// Per-origin grant state over a [`GrantRepository`].
///
/// Cheap to clone; clones share the repository.
#[derive(Clone)]
pub struct PermissionStore {
    repo: Arc<dyn GrantRepository>,
    clock: Arc<dyn Clock>,
    once_ttl: Duration,
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStore")
            .field("clock", &self.clock)
            .field("once_ttl", &self.once_ttl)
            .finish_non_exhaustive()
    }
}

/// Longest once-grant the store will issue.
const MAX_ONCE_TTL: Duration = Duration::days(36_500);

impl PermissionStore {
    /// Store over `repo`, timing once-grants with `clock`.
    pub fn new(repo: Arc<dyn GrantRepository>, clock: Arc<dyn Clock>, once_ttl: std::time::Duration) -> Self {
        Self {
            repo,
            clock,
            once_ttl: Duration::from_std(once_ttl).map_or(MAX_ONCE_TTL, |ttl| ttl.min(MAX_ONCE_TTL)),
        }
    }

    /// Ephemeral store on the system clock.
    pub fn in_memory(once_ttl: std::time::Duration) -> Self {
        Self::new(Arc::new(MemoryGrantRepository::new()), Arc::new(SystemClock), once_ttl)
    }

    /// Effective record for `origin` (empty if none is stored). Lapsed
    /// once-grants are omitted.
    pub fn record(&self, origin: &Origin) -> Result<OriginPermissionRecord> {
        let now = self.clock.now();
        Ok(self
            .repo
            .load(origin)?
            .map_or_else(|| OriginPermissionRecord::new(origin.clone()), |r| r.effective(now)))
    }

    /// Effective status of one scope.
    pub fn status(&self, origin: &Origin, scope: CapabilityScope) -> Result<GrantStatus> {
        Ok(self.record(origin)?.status(scope, self.clock.now()))
    }

    /// Effective status of each of `scopes`.
    pub fn statuses(
        &self,
        origin: &Origin,
        scopes: &[CapabilityScope],
    ) -> Result<BTreeMap<CapabilityScope, GrantStatus>> {
        let now = self.clock.now();
        let record = self.repo.load(origin)?;
        Ok(scopes
            .iter()
            .map(|&scope| {
                let status = record
                    .as_ref()
                    .map_or(GrantStatus::NotGranted, |r| r.status(scope, now));
                (scope, status)
            })
            .collect())
    }

    /// Partition `required` by effective status.
    pub fn check(&self, origin: &Origin, required: &[CapabilityScope]) -> Result<ScopeCheck> {
        let now = self.clock.now();
        let record = self.repo.load(origin)?;
        let mut check = ScopeCheck::default();
        for &scope in required {
            let status = record
                .as_ref()
                .map_or(GrantStatus::NotGranted, |r| r.status(scope, now));
            match status {
                GrantStatus::GrantedOnce | GrantStatus::GrantedAlways => check.granted.push(scope),
                GrantStatus::Denied => check.denied.push(scope),
                GrantStatus::NotGranted => check.missing.push(scope),
            }
        }
        Ok(check)
    }

    /// Record a prompt decision for `scopes`.
    ///
    /// Allow decisions also replace the tool allowlist when `allowed_tools`
    /// is given. Once-grants expire after the configured lifetime and, when
    /// `context` is given, when that context closes.
    pub fn apply_decision(
        &self,
        origin: &Origin,
        scopes: &[CapabilityScope],
        decision: GrantDecision,
        allowed_tools: Option<&[String]>,
        context: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let grant = match decision {
            GrantDecision::AllowOnce => Grant::once(now, self.once_ttl, context.map(str::to_owned)),
            GrantDecision::AllowAlways => Grant::always(now),
            GrantDecision::Deny => Grant::denied(now),
        };
        for &scope in scopes {
            self.repo.put_grant(origin, scope, &grant)?;
        }
        if decision != GrantDecision::Deny {
            if let Some(tools) = allowed_tools {
                let set: BTreeSet<String> = tools.iter().cloned().collect();
                self.repo.set_allowed_tools(origin, Some(&set))?;
            }
        }
        info!(%origin, decision = decision.as_str(), ?scopes, "permission decision recorded");
        Ok(())
    }

    /// Whether `tool` passes the origin's allowlist.
    pub fn is_tool_allowed(&self, origin: &Origin, tool: &str) -> Result<bool> {
        Ok(self
            .repo
            .load(origin)?
            .is_none_or(|r| r.tool_allowed(tool)))
    }

    /// The origin's allowlist, if restricted.
    pub fn allowed_tools(&self, origin: &Origin) -> Result<Option<Vec<String>>> {
        Ok(self
            .repo
            .load(origin)?
            .and_then(|r| r.allowed_tools)
            .map(|set| set.into_iter().collect()))
    }

    /// Replace the origin's allowlist (`None` = unrestricted).
    pub fn set_allowed_tools(&self, origin: &Origin, tools: Option<&[String]>) -> Result<()> {
        let set: Option<BTreeSet<String>> = tools.map(|t| t.iter().cloned().collect());
        self.repo.set_allowed_tools(origin, set.as_ref())
    }

    /// Forget everything about `origin`: every scope returns to
    /// `NotGranted` and the allowlist is cleared.
    pub fn revoke(&self, origin: &Origin) -> Result<bool> {
        let removed = self.repo.delete_origin(origin)?;
        info!(%origin, removed, "permissions revoked");
        Ok(removed)
    }

    /// Return one scope to `NotGranted`.
    pub fn revoke_scope(&self, origin: &Origin, scope: CapabilityScope) -> Result<bool> {
        let removed = self.repo.delete_grant(origin, scope)?;
        info!(%origin, %scope, removed, "scope revoked");
        Ok(removed)
    }

    /// Drop every once-grant bound to `context`.
    pub fn context_closed(&self, context: &str) -> Result<usize> {
        let removed = self.repo.delete_context_grants(context)?;
        if removed > 0 {
            debug!(context, removed, "context-bound grants dropped");
        }
        Ok(removed)
    }

    /// Effective records of every stored origin.
    pub fn list(&self) -> Result<Vec<OriginPermissionRecord>> {
        let now = self.clock.now();
        Ok(self.repo.list()?.iter().map(|r| r.effective(now)).collect())
    }
}
