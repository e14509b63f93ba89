//! In-memory repository for tests and ephemeral arbiters.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use warden_core::{CapabilityScope, Origin};

use crate::errors::Result;
use crate::grant::{Grant, OriginPermissionRecord};
use crate::repository::GrantRepository;

/// Repository backed by a map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryGrantRepository {
    records: Mutex<BTreeMap<Origin, OriginPermissionRecord>>,
}

impl MemoryGrantRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GrantRepository for MemoryGrantRepository {
    fn load(&self, origin: &Origin) -> Result<Option<OriginPermissionRecord>> {
        Ok(self.records.lock().get(origin).cloned())
    }

    fn put_grant(&self, origin: &Origin, scope: CapabilityScope, grant: &Grant) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .entry(origin.clone())
            .or_insert_with(|| OriginPermissionRecord::new(origin.clone()));
        let _ = record.scopes.insert(scope, grant.clone());
        Ok(())
    }

    fn delete_grant(&self, origin: &Origin, scope: CapabilityScope) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .get_mut(origin)
            .is_some_and(|r| r.scopes.remove(&scope).is_some()))
    }

    fn set_allowed_tools(&self, origin: &Origin, tools: Option<&BTreeSet<String>>) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .entry(origin.clone())
            .or_insert_with(|| OriginPermissionRecord::new(origin.clone()));
        record.allowed_tools = tools.cloned();
        Ok(())
    }

    fn delete_origin(&self, origin: &Origin) -> Result<bool> {
        Ok(self.records.lock().remove(origin).is_some())
    }

    fn delete_context_grants(&self, context: &str) -> Result<usize> {
        let mut removed = 0;
        for record in self.records.lock().values_mut() {
            let before = record.scopes.len();
            record
                .scopes
                .retain(|_, g| g.bound_context.as_deref() != Some(context));
            removed += before - record.scopes.len();
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<OriginPermissionRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
