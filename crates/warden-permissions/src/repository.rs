//! Storage seam for permission records.

use std::collections::BTreeSet;

use warden_core::{CapabilityScope, Origin};

use crate::errors::Result;
use crate::grant::{Grant, OriginPermissionRecord};

/// Persistence for [`OriginPermissionRecord`]s.
///
/// Implementations store at most one grant per `(origin, scope)` and
/// overwrite on write. Records are created on first write.
pub trait GrantRepository: Send + Sync {
    /// Load the record for `origin`, if one exists.
    fn load(&self, origin: &Origin) -> Result<Option<OriginPermissionRecord>>;

    /// Store `grant` for `(origin, scope)`, replacing any previous grant.
    fn put_grant(&self, origin: &Origin, scope: CapabilityScope, grant: &Grant) -> Result<()>;

    /// Remove the grant for `(origin, scope)`. Returns whether one existed.
    fn delete_grant(&self, origin: &Origin, scope: CapabilityScope) -> Result<bool>;

    /// Replace the tool allowlist (`None` = unrestricted).
    fn set_allowed_tools(&self, origin: &Origin, tools: Option<&BTreeSet<String>>) -> Result<()>;

    /// Remove the whole record. Returns whether one existed.
    fn delete_origin(&self, origin: &Origin) -> Result<bool>;

    /// Remove every grant bound to `context`. Returns how many were removed.
    fn delete_context_grants(&self, context: &str) -> Result<usize>;

    /// Every stored record.
    fn list(&self) -> Result<Vec<OriginPermissionRecord>>;
}
