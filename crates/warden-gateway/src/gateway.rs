//! Capability dispatch with permission enforcement.
//!
//! Order of checks for a registered capability:
//!
//! 1. unknown identifier → `NOT_IMPLEMENTED`
//! 2. any required scope `Denied` → `PERMISSION_DENIED` (no prompt)
//! 3. scopes `NotGranted` → one prompt for exactly those scopes, serialized
//!    per origin; a deny (explicit or implicit) → `SCOPE_REQUIRED`
//! 4. tool-gated capability → tool id must pass the allowlist
//! 5. handler

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use warden_core::{CapabilityScope, Origin, PromptId, ProtocolError};
use warden_permissions::{GrantDecision, PermissionStore};
use warden_settings::PermissionSettings;

use crate::handler::{CallContext, HandlerOutput};
use crate::mediator::{PromptDecision, PromptMediator, PromptRequest};
use crate::registry::{CapabilityRegistry, resolve_tool};

/// Explicit grant request.
pub const PERMISSIONS_REQUEST: &str = "permissions.request";
/// The caller's own permission record.
pub const PERMISSIONS_LIST: &str = "permissions.list";
/// Liveness.
pub const SYSTEM_PING: &str = "system.ping";

const BUILTINS: [&str; 3] = [PERMISSIONS_REQUEST, PERMISSIONS_LIST, SYSTEM_PING];

/// Gateway tuning.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Bound on waiting for a prompt decision.
    pub prompt_wait: Duration,
    /// Bound on a handler producing its output (a value, or the start of a
    /// stream).
    pub handler_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prompt_wait: Duration::from_secs(120),
            handler_timeout: Duration::from_secs(300),
        }
    }
}

impl GatewayConfig {
    /// Prompt bound from loaded settings.
    pub fn from_settings(settings: &PermissionSettings) -> Self {
        Self {
            prompt_wait: settings.prompt_wait(),
            ..Self::default()
        }
    }
}

enum Resolution {
    Satisfied,
    Denied(Vec<CapabilityScope>),
    Prompted {
        missing: Vec<CapabilityScope>,
        allowed: bool,
    },
}

#[derive(Debug, Deserialize)]
struct PermissionRequestParams {
    scopes: Vec<CapabilityScope>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    tools: Option<Vec<String>>,
}

/// Entry point for every capability request on the arbiter side.
pub struct CapabilityGateway {
    registry: CapabilityRegistry,
    store: PermissionStore,
    mediator: Arc<dyn PromptMediator>,
    config: GatewayConfig,
    prompt_locks: Mutex<HashMap<Origin, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapabilityGateway {
    /// Gateway over a capability table, a store, and a prompt mediator.
    pub fn new(
        registry: CapabilityRegistry,
        store: PermissionStore,
        mediator: Arc<dyn PromptMediator>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            store,
            mediator,
            config,
            prompt_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The permission store, for arbiter-local revocation.
    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    /// Every dispatchable identifier, built-ins included, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut names = self.registry.capabilities();
        names.extend(BUILTINS.iter().map(|s| (*s).to_owned()));
        names.sort();
        names
    }

    /// Dispatch one request.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        capability: &str,
        payload: Option<Value>,
    ) -> Result<HandlerOutput, ProtocolError> {
        counter!("capability_requests_total", "capability" => capability.to_owned()).increment(1);
        let start = Instant::now();

        let result = match capability {
            PERMISSIONS_REQUEST => self.request_permissions(ctx, payload).await.map(HandlerOutput::Value),
            PERMISSIONS_LIST => self.list_permissions(ctx).await.map(HandlerOutput::Value),
            SYSTEM_PING => Ok(HandlerOutput::Value(json!({
                "pong": true,
                "version": env!("CARGO_PKG_VERSION"),
            }))),
            _ => self.dispatch_registered(ctx, capability, payload).await,
        };

        if let Err(err) = &result {
            counter!(
                "capability_errors_total",
                "capability" => capability.to_owned(),
                "code" => err.code().to_owned()
            )
            .increment(1);
            debug!(origin = %ctx.origin, capability, code = err.code(), "capability failed");
        }
        histogram!("capability_duration_seconds", "capability" => capability.to_owned())
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_registered(
        &self,
        ctx: &CallContext,
        capability: &str,
        payload: Option<Value>,
    ) -> Result<HandlerOutput, ProtocolError> {
        let entry = self
            .registry
            .get(capability)
            .ok_or_else(|| ProtocolError::NotImplemented(capability.to_owned()))?;

        self.ensure_scopes(ctx, &entry.spec.required_scopes).await?;

        if entry.spec.tool_gated {
            let tool = resolve_tool(payload.as_ref())
                .ok_or_else(|| ProtocolError::InvalidParams("tool identifier required".into()))?;
            self.ensure_tool(&ctx.origin, tool).await?;
        }

        let handler = Arc::clone(&entry.handler);
        match tokio::time::timeout(self.config.handler_timeout, handler.handle(ctx, payload)).await {
            Ok(output) => output,
            Err(_elapsed) => {
                warn!(capability, "handler timed out after {:?}", self.config.handler_timeout);
                Err(ProtocolError::Timeout(format!("handler for '{capability}' timed out")))
            }
        }
    }

    async fn ensure_scopes(&self, ctx: &CallContext, required: &[CapabilityScope]) -> Result<(), ProtocolError> {
        if required.is_empty() {
            return Ok(());
        }
        let check = self.check(&ctx.origin, required).await?;
        if !check.denied.is_empty() {
            return Err(ProtocolError::PermissionDenied { denied: check.denied });
        }
        if check.missing.is_empty() {
            return Ok(());
        }
        match self.resolve_missing(ctx, required, None, None, false).await? {
            Resolution::Satisfied | Resolution::Prompted { allowed: true, .. } => Ok(()),
            Resolution::Denied(denied) => Err(ProtocolError::PermissionDenied { denied }),
            Resolution::Prompted { missing, allowed: false } => Err(ProtocolError::ScopeRequired { missing }),
        }
    }

    /// Re-check `scopes` under the origin's prompt lock and prompt for the
    /// ones still missing. With `prompt_despite_denied` unset, a denied
    /// scope short-circuits without prompting.
    async fn resolve_missing(
        &self,
        ctx: &CallContext,
        scopes: &[CapabilityScope],
        reason: Option<String>,
        tools: Option<Vec<String>>,
        prompt_despite_denied: bool,
    ) -> Result<Resolution, ProtocolError> {
        let lock = self.prompt_lock(&ctx.origin);
        let outcome = {
            let _guard = lock.lock().await;
            // another request may have prompted while we waited
            let check = self.check(&ctx.origin, scopes).await;
            match check {
                Err(e) => Err(e),
                Ok(check) if !check.denied.is_empty() && !prompt_despite_denied => {
                    Ok(Resolution::Denied(check.denied))
                }
                Ok(check) if check.missing.is_empty() => Ok(Resolution::Satisfied),
                Ok(check) => {
                    let missing = check.missing;
                    self.prompt(ctx, &missing, reason, tools).await.map(|decision| {
                        let allowed = decision.is_some_and(|d| d.decision != GrantDecision::Deny);
                        Resolution::Prompted { missing, allowed }
                    })
                }
            }
        };
        self.release_prompt_lock(&ctx.origin, &lock);
        outcome
    }

    async fn ensure_tool(&self, origin: &Origin, tool: String) -> Result<(), ProtocolError> {
        let (allowed, allowlist) = {
            let origin = origin.clone();
            let tool = tool.clone();
            self.blocking(move |store| {
                Ok((store.is_tool_allowed(&origin, &tool)?, store.allowed_tools(&origin)?))
            })
            .await?
        };
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::ToolNotAllowed {
                tool,
                allowed: allowlist.unwrap_or_default(),
            })
        }
    }

    /// Prompt for `scopes` and record the decision. `Ok(None)` is an
    /// implicit deny (surface closed or wait elapsed) and is not persisted.
    async fn prompt(
        &self,
        ctx: &CallContext,
        scopes: &[CapabilityScope],
        reason: Option<String>,
        tools: Option<Vec<String>>,
    ) -> Result<Option<PromptDecision>, ProtocolError> {
        let request = PromptRequest {
            prompt_id: PromptId::new(),
            origin: ctx.origin.clone(),
            scopes: scopes.to_vec(),
            reason,
            tools,
        };
        info!(origin = %ctx.origin, ?scopes, prompt_id = %request.prompt_id, "prompting for permission");

        let decision = match tokio::time::timeout(self.config.prompt_wait, self.mediator.prompt(request)).await {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                counter!("permission_prompts_total", "decision" => "closed").increment(1);
                info!(origin = %ctx.origin, "prompt closed without a decision, treating as deny");
                return Ok(None);
            }
            Err(_elapsed) => {
                counter!("permission_prompts_total", "decision" => "timeout").increment(1);
                info!(origin = %ctx.origin, "prompt unanswered, treating as deny");
                return Ok(None);
            }
        };
        counter!("permission_prompts_total", "decision" => decision.decision.as_str()).increment(1);

        let origin = ctx.origin.clone();
        let scopes = scopes.to_vec();
        let context = ctx.context.clone();
        let recorded = decision.clone();
        self.blocking(move |store| {
            store.apply_decision(
                &origin,
                &scopes,
                recorded.decision,
                recorded.allowed_tools.as_deref(),
                context.as_deref(),
            )
        })
        .await?;
        Ok(Some(decision))
    }

    async fn request_permissions(&self, ctx: &CallContext, payload: Option<Value>) -> Result<Value, ProtocolError> {
        let params: PermissionRequestParams = serde_json::from_value(payload.unwrap_or(Value::Null))
            .map_err(|e| ProtocolError::InvalidParams(format!("invalid permissions.request payload: {e}")))?;
        if params.scopes.is_empty() {
            return Err(ProtocolError::InvalidParams("scopes must not be empty".into()));
        }

        let origin = &ctx.origin;
        let check = self.check(origin, &params.scopes).await?;
        if !check.missing.is_empty() {
            // denied scopes are reported, never re-prompted
            let _ = self
                .resolve_missing(ctx, &params.scopes, params.reason.clone(), params.tools.clone(), true)
                .await?;
        }

        let (statuses, allowed_tools) = {
            let origin = origin.clone();
            let scopes = params.scopes.clone();
            self.blocking(move |store| Ok((store.statuses(&origin, &scopes)?, store.allowed_tools(&origin)?)))
                .await?
        };
        let granted = statuses.values().all(|s| s.is_granted());

        let mut result = json!({ "granted": granted, "scopes": statuses });
        if let Some(tools) = allowed_tools {
            result["allowedTools"] = json!(tools);
        }
        Ok(result)
    }

    async fn list_permissions(&self, ctx: &CallContext) -> Result<Value, ProtocolError> {
        let origin = ctx.origin.clone();
        let record = self.blocking(move |store| store.record(&origin)).await?;
        serde_json::to_value(record).map_err(|e| ProtocolError::Internal(e.to_string()))
    }

    async fn check(
        &self,
        origin: &Origin,
        required: &[CapabilityScope],
    ) -> Result<warden_permissions::ScopeCheck, ProtocolError> {
        let origin = origin.clone();
        let required = required.to_vec();
        self.blocking(move |store| store.check(&origin, &required)).await
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, ProtocolError>
    where
        T: Send + 'static,
        F: FnOnce(&PermissionStore) -> warden_permissions::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| ProtocolError::Internal(format!("permission store task failed: {e}")))?
            .map_err(|e| {
                warn!(error = %e, "permission store error");
                ProtocolError::Internal(format!("permission store error: {e}"))
            })
    }

    fn prompt_lock(&self, origin: &Origin) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.prompt_locks.lock().entry(origin.clone()).or_default())
    }

    fn release_prompt_lock(&self, origin: &Origin, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.prompt_locks.lock();
        // map + caller are the only holders: nobody is queued behind it
        if Arc::strong_count(lock) == 2 {
            let _ = locks.remove(origin);
        }
    }
}
