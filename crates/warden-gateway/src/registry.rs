//! Capability table: identifier → required scopes + handler.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use warden_core::CapabilityScope;

use crate::handler::CapabilityHandler;

/// Enforcement metadata of one capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilitySpec {
    /// Scopes that must all be granted.
    pub required_scopes: Vec<CapabilityScope>,
    /// Whether the payload names a tool that must pass the origin's
    /// allowlist.
    pub tool_gated: bool,
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) spec: CapabilitySpec,
    pub(crate) handler: Arc<dyn CapabilityHandler>,
}

/// Registry mapping capability identifiers to handlers.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Entry>,
}

impl CapabilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability gated by `scopes`.
    pub fn register(
        &mut self,
        capability: &str,
        scopes: &[CapabilityScope],
        handler: impl CapabilityHandler + 'static,
    ) {
        self.insert(capability, scopes, false, Arc::new(handler));
    }

    /// Register a tool-invoking capability: gated by `scopes` and by the
    /// origin's tool allowlist.
    pub fn register_tool(
        &mut self,
        capability: &str,
        scopes: &[CapabilityScope],
        handler: impl CapabilityHandler + 'static,
    ) {
        self.insert(capability, scopes, true, Arc::new(handler));
    }

    fn insert(
        &mut self,
        capability: &str,
        scopes: &[CapabilityScope],
        tool_gated: bool,
        handler: Arc<dyn CapabilityHandler>,
    ) {
        let spec = CapabilitySpec {
            required_scopes: scopes.to_vec(),
            tool_gated,
        };
        let _ = self
            .entries
            .insert(capability.to_owned(), Entry { spec, handler });
    }

    pub(crate) fn get(&self, capability: &str) -> Option<&Entry> {
        self.entries.get(capability)
    }

    /// Enforcement metadata for `capability`.
    pub fn spec(&self, capability: &str) -> Option<&CapabilitySpec> {
        self.entries.get(capability).map(|e| &e.spec)
    }

    /// Whether `capability` is registered.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.entries.contains_key(capability)
    }

    /// Registered identifiers, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Tool identifier named by a tool-invoking payload: either `tool`, or
/// `serverId` + `toolName` joined as `server/tool`.
pub fn resolve_tool(payload: Option<&Value>) -> Option<String> {
    let payload = payload?;
    if let Some(tool) = payload.get("tool").and_then(Value::as_str) {
        return Some(tool.to_owned());
    }
    let server = payload.get("serverId").and_then(Value::as_str)?;
    let name = payload.get("toolName").and_then(Value::as_str)?;
    Some(format!("{server}/{name}"))
}
