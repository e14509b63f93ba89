//! The permission-prompt boundary.
//!
//! The gateway emits one [`PromptRequest`] per prompt and waits for exactly
//! one [`PromptDecision`]. A mediator that returns `None` (its surface
//! closed) or does not answer within the gateway's bounded wait is treated
//! as an implicit deny.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use warden_core::{CapabilityScope, Origin, PromptId};
use warden_permissions::GrantDecision;
use warden_settings::HeadlessDecision;

/// A pending grant decision, as shown to the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    /// Correlates the decision with this prompt.
    pub prompt_id: PromptId,
    /// Origin asking for access.
    pub origin: Origin,
    /// Exactly the scopes that are not yet granted or denied.
    pub scopes: Vec<CapabilityScope>,
    /// Caller-supplied justification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Tools the caller wants to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

/// The user's answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDecision {
    /// Prompt being answered.
    pub prompt_id: PromptId,
    /// The decision.
    pub decision: GrantDecision,
    /// Tools the user approved. Replaces the origin's allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

/// Presents prompts to the user.
#[async_trait]
pub trait PromptMediator: Send + Sync {
    /// Show `request` and return the user's decision, or `None` if the
    /// prompt surface closed without one.
    async fn prompt(&self, request: PromptRequest) -> Option<PromptDecision>;
}

/// Answers every prompt with a fixed decision. Used by headless arbiters
/// and tests.
#[derive(Debug)]
pub struct StaticMediator {
    decision: GrantDecision,
    allowed_tools: Option<Vec<String>>,
    prompts: AtomicUsize,
}

impl StaticMediator {
    /// Mediator answering `decision`.
    pub fn new(decision: GrantDecision) -> Self {
        Self {
            decision,
            allowed_tools: None,
            prompts: AtomicUsize::new(0),
        }
    }

    /// Mediator for the configured headless decision.
    pub fn from_headless(decision: HeadlessDecision) -> Self {
        Self::new(match decision {
            HeadlessDecision::Deny => GrantDecision::Deny,
            HeadlessDecision::AllowOnce => GrantDecision::AllowOnce,
            HeadlessDecision::AllowAlways => GrantDecision::AllowAlways,
        })
    }

    /// Also approve exactly these tools.
    #[must_use]
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    /// Prompts answered so far.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PromptMediator for StaticMediator {
    async fn prompt(&self, request: PromptRequest) -> Option<PromptDecision> {
        let _ = self.prompts.fetch_add(1, Ordering::SeqCst);
        debug!(origin = %request.origin, decision = self.decision.as_str(), "answering prompt automatically");
        Some(PromptDecision {
            prompt_id: request.prompt_id,
            decision: self.decision,
            allowed_tools: self.allowed_tools.clone(),
        })
    }
}

/// Forwards prompts to a UI task and resolves them by `promptId`.
#[derive(Debug)]
pub struct ChannelMediator {
    requests: mpsc::Sender<PromptRequest>,
    pending: Mutex<HashMap<PromptId, oneshot::Sender<PromptDecision>>>,
}

impl ChannelMediator {
    /// Mediator plus the receiver the UI reads prompts from.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PromptRequest>) {
        let (requests, rx) = mpsc::channel(buffer);
        let mediator = Self {
            requests,
            pending: Mutex::new(HashMap::new()),
        };
        (mediator, rx)
    }

    /// Deliver a decision from the UI. Decisions for unknown or already
    /// answered prompts are ignored; returns whether one was delivered.
    pub fn resolve(&self, decision: PromptDecision) -> bool {
        let Some(waiter) = self.pending.lock().remove(&decision.prompt_id) else {
            debug!(prompt_id = %decision.prompt_id, "decision for unknown prompt ignored");
            return false;
        };
        waiter.send(decision).is_ok()
    }

    /// Prompts awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes a prompt's waiter when the prompt is abandoned.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<PromptId, oneshot::Sender<PromptDecision>>>,
    prompt_id: PromptId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pending.lock().remove(&self.prompt_id);
    }
}

#[async_trait]
impl PromptMediator for ChannelMediator {
    async fn prompt(&self, request: PromptRequest) -> Option<PromptDecision> {
        let (tx, rx) = oneshot::channel();
        let prompt_id = request.prompt_id.clone();
        let _ = self.pending.lock().insert(prompt_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            prompt_id,
        };
        if self.requests.send(request).await.is_err() {
            debug!("prompt surface closed");
            return None;
        }
        rx.await.ok()
    }
}
