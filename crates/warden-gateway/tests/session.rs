//! Client ↔ arbiter session end to end, over an in-process pipe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warden_core::{CapabilityScope, Origin, ProtocolError, StreamEvent};
use warden_gateway::{
    ArbiterSession, CallContext, CapabilityGateway, CapabilityHandler, CapabilityRegistry,
    ChannelMediator, GatewayConfig, HandlerOutput, PromptDecision, PromptMediator, PromptRequest,
    StaticMediator,
};
use warden_permissions::{
    GrantDecision, GrantStatus, ManualClock, MemoryGrantRepository, PermissionStore,
};
use warden_transport::pipe::duplex;
use warden_transport::{CallError, CapabilityClient, ChannelConfig, ClientConfig, arbiter_channel};

const ORIGIN: &str = "https://a.example";

fn origin() -> Origin {
    Origin::parse(ORIGIN).unwrap()
}

// ── Handlers ────────────────────────────────────────────────────────────────

/// Echoes the payload together with the origin it was attributed to.
struct Echo {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CapabilityHandler for Echo {
    async fn handle(&self, ctx: &CallContext, payload: Option<Value>) -> Result<HandlerOutput, ProtocolError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput::Value(json!({
            "origin": ctx.origin.as_str(),
            "payload": payload,
        })))
    }
}

/// Two tokens and no terminal event.
struct Tokens;

#[async_trait]
impl CapabilityHandler for Tokens {
    async fn handle(&self, _ctx: &CallContext, _payload: Option<Value>) -> Result<HandlerOutput, ProtocolError> {
        let events = async_stream::stream! {
            yield StreamEvent::Token { text: "a".into() };
            yield StreamEvent::Token { text: "b".into() };
        };
        Ok(HandlerOutput::Stream(Box::pin(events)))
    }
}

/// One token, then nothing until dropped. Reports the drop.
struct Endless {
    dropped: Mutex<Option<oneshot::Sender<()>>>,
}

struct NotifyOnDrop(Option<oneshot::Sender<()>>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl CapabilityHandler for Endless {
    async fn handle(&self, _ctx: &CallContext, _payload: Option<Value>) -> Result<HandlerOutput, ProtocolError> {
        let guard = NotifyOnDrop(self.dropped.lock().take());
        let events = async_stream::stream! {
            let _guard = guard;
            yield StreamEvent::Token { text: "first".into() };
            futures::future::pending::<()>().await;
        };
        Ok(HandlerOutput::Stream(Box::pin(events)))
    }
}

struct Panics;

#[async_trait]
impl CapabilityHandler for Panics {
    async fn handle(&self, _ctx: &CallContext, _payload: Option<Value>) -> Result<HandlerOutput, ProtocolError> {
        panic!("handler exploded");
    }
}

/// Knows one live session, `s_live`.
struct SessionInfo;

#[async_trait]
impl CapabilityHandler for SessionInfo {
    async fn handle(&self, _ctx: &CallContext, payload: Option<Value>) -> Result<HandlerOutput, ProtocolError> {
        let id = payload
            .as_ref()
            .and_then(|p| p["sessionId"].as_str())
            .unwrap_or_default()
            .to_owned();
        if id == "s_live" {
            return Ok(HandlerOutput::Value(json!({ "sessionId": id })));
        }
        Err(ProtocolError::SessionNotFound(id))
    }
}

/// Answers prompts from a script; `None` once the script runs out.
#[derive(Default)]
struct ScriptedMediator {
    decisions: Mutex<VecDeque<GrantDecision>>,
    prompts: AtomicUsize,
}

impl ScriptedMediator {
    fn new(decisions: impl IntoIterator<Item = GrantDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            prompts: AtomicUsize::new(0),
        }
    }

    fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PromptMediator for ScriptedMediator {
    async fn prompt(&self, request: PromptRequest) -> Option<PromptDecision> {
        let _ = self.prompts.fetch_add(1, Ordering::SeqCst);
        let decision = self.decisions.lock().pop_front()?;
        Some(PromptDecision {
            prompt_id: request.prompt_id,
            decision,
            allowed_tools: None,
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    client: CapabilityClient,
    gateway: Arc<CapabilityGateway>,
    session: JoinHandle<()>,
    calls: Arc<AtomicUsize>,
}

fn registry(calls: &Arc<AtomicUsize>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        "ai.prompt",
        &[CapabilityScope::GenerateText],
        Echo {
            calls: Arc::clone(calls),
        },
    );
    registry.register_tool(
        "tools.call",
        &[CapabilityScope::ToolCall],
        Echo {
            calls: Arc::clone(calls),
        },
    );
    registry.register("ai.stream", &[CapabilityScope::GenerateText], Tokens);
    registry.register("agent.explode", &[], Panics);
    registry
}

fn start(store: PermissionStore, mediator: Arc<dyn PromptMediator>, config: GatewayConfig) -> Harness {
    start_with(store, mediator, config, |_| {})
}

fn start_with(
    store: PermissionStore,
    mediator: Arc<dyn PromptMediator>,
    config: GatewayConfig,
    extra: impl FnOnce(&mut CapabilityRegistry),
) -> Harness {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry(&calls);
    extra(&mut registry);
    let gateway = Arc::new(CapabilityGateway::new(registry, store, mediator, config));

    let ((c_tx, c_rx), (a_tx, a_rx)) = duplex();
    let client = CapabilityClient::connect(
        c_tx,
        c_rx,
        ChannelConfig::new("warden"),
        ClientConfig::new("warden"),
    );
    let (sender, receiver) = arbiter_channel(a_tx, a_rx, ChannelConfig::new("warden"), origin());
    let session = tokio::spawn(
        ArbiterSession::new(Arc::clone(&gateway), sender, receiver)
            .with_context("conn_1")
            .run(),
    );
    Harness {
        client,
        gateway,
        session,
        calls,
    }
}

fn store() -> PermissionStore {
    PermissionStore::in_memory(Duration::from_secs(600))
}

fn remote_code(err: &CallError) -> &str {
    err.code()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_needs_no_permission() {
    let mediator = Arc::new(ScriptedMediator::default());
    let h = start(store(), mediator.clone(), GatewayConfig::default());
    let pong = h.client.call("system.ping", None).await.unwrap();
    assert_eq!(pong["pong"], true);
    assert_eq!(mediator.prompt_count(), 0);
}

#[tokio::test]
async fn unknown_capability_is_not_implemented() {
    let h = start(store(), Arc::new(ScriptedMediator::default()), GatewayConfig::default());
    let err = h.client.call("ai.dream", None).await.unwrap_err();
    assert_eq!(remote_code(&err), "NOT_IMPLEMENTED");
}

#[tokio::test]
async fn stale_session_id_passes_through_unchanged() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start_with(store(), mediator, GatewayConfig::default(), |registry| {
        registry.register("ai.sessionInfo", &[CapabilityScope::GenerateText], SessionInfo);
    });

    let live = h
        .client
        .call("ai.sessionInfo", Some(json!({"sessionId": "s_live"})))
        .await
        .unwrap();
    assert_eq!(live["sessionId"], "s_live");

    let err = h
        .client
        .call("ai.sessionInfo", Some(json!({"sessionId": "s_stale"})))
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), "SESSION_NOT_FOUND");
    assert_matches!(err, CallError::Remote(body) if body.message.contains("s_stale"));
}

#[tokio::test]
async fn request_is_attributed_to_channel_origin() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store(), mediator, GatewayConfig::default());
    let result = h
        .client
        .call("ai.prompt", Some(json!({"prompt": "hi", "origin": "https://evil.example"})))
        .await
        .unwrap();
    assert_eq!(result["origin"], ORIGIN);
    assert_eq!(result["payload"]["prompt"], "hi");
}

#[tokio::test]
async fn concurrent_calls_share_one_prompt() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store(), mediator.clone(), GatewayConfig::default());

    let calls = (0..5).map(|i| h.client.call("ai.prompt", Some(json!({"n": i}))));
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(mediator.prompt_count(), 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn allow_once_expires_and_reprompts() {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let store = PermissionStore::new(
        Arc::new(MemoryGrantRepository::new()),
        clock.clone(),
        Duration::from_secs(600),
    );
    let mediator = Arc::new(ScriptedMediator::new([GrantDecision::AllowOnce, GrantDecision::Deny]));
    let h = start(store, mediator.clone(), GatewayConfig::default());

    let _ = h.client.call("ai.prompt", None).await.unwrap();
    assert_eq!(mediator.prompt_count(), 1);

    clock.advance(chrono::Duration::minutes(1));
    let _ = h.client.call("ai.prompt", None).await.unwrap();
    assert_eq!(mediator.prompt_count(), 1);

    clock.advance(chrono::Duration::minutes(10));
    let err = h.client.call("ai.prompt", None).await.unwrap_err();
    assert_eq!(remote_code(&err), "SCOPE_REQUIRED");
    assert_eq!(err.missing_scopes(), vec![CapabilityScope::GenerateText]);
    assert_eq!(mediator.prompt_count(), 2);
}

#[tokio::test]
async fn tool_outside_allowlist_is_rejected() {
    let mediator = Arc::new(
        StaticMediator::new(GrantDecision::AllowAlways).with_allowed_tools(vec!["srv/y".into()]),
    );
    let h = start(store(), mediator, GatewayConfig::default());

    let err = h
        .client
        .call("tools.call", Some(json!({"tool": "srv/x", "args": {}})))
        .await
        .unwrap_err();
    assert_matches!(&err, CallError::Remote(body) if body.code == "TOOL_NOT_ALLOWED");
    if let CallError::Remote(body) = err {
        assert_eq!(body.details.unwrap()["allowedTools"], json!(["srv/y"]));
    }

    let ok = h
        .client
        .call("tools.call", Some(json!({"serverId": "srv", "toolName": "y"})))
        .await
        .unwrap();
    assert_eq!(ok["payload"]["toolName"], "y");
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tool_call_without_tool_id_is_invalid() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store(), mediator, GatewayConfig::default());
    let err = h.client.call("tools.call", Some(json!({"args": {}}))).await.unwrap_err();
    assert_eq!(remote_code(&err), "INVALID_PARAMS");
}

#[tokio::test]
async fn stored_deny_fails_without_prompting() {
    let store = store();
    store
        .apply_decision(&origin(), &[CapabilityScope::GenerateText], GrantDecision::Deny, None, None)
        .unwrap();
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store, mediator.clone(), GatewayConfig::default());

    let err = h.client.call("ai.prompt", None).await.unwrap_err();
    assert_eq!(remote_code(&err), "PERMISSION_DENIED");
    assert_eq!(mediator.prompt_count(), 0);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn revoke_forces_a_new_prompt() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store(), mediator.clone(), GatewayConfig::default());

    let _ = h.client.call("ai.prompt", None).await.unwrap();
    let _ = h.client.call("ai.prompt", None).await.unwrap();
    assert_eq!(mediator.prompt_count(), 1);

    assert!(h.gateway.store().revoke(&origin()).unwrap());
    let _ = h.client.call("ai.prompt", None).await.unwrap();
    assert_eq!(mediator.prompt_count(), 2);
}

#[tokio::test]
async fn unanswered_prompt_is_an_implicit_deny() {
    let (mediator, _prompts) = ChannelMediator::new(8);
    let config = GatewayConfig {
        prompt_wait: Duration::from_millis(100),
        ..GatewayConfig::default()
    };
    let h = start(store(), Arc::new(mediator), config);

    let err = h.client.call("ai.prompt", None).await.unwrap_err();
    assert_eq!(remote_code(&err), "SCOPE_REQUIRED");
    assert_eq!(
        h.gateway.store().status(&origin(), CapabilityScope::GenerateText).unwrap(),
        GrantStatus::NotGranted
    );
}

#[tokio::test]
async fn ui_decision_resolves_the_prompt() {
    let (mediator, mut prompts) = ChannelMediator::new(8);
    let mediator = Arc::new(mediator);
    let h = start(store(), mediator.clone(), GatewayConfig::default());

    let ui = tokio::spawn(async move {
        let request = prompts.recv().await.unwrap();
        assert_eq!(request.origin, origin());
        assert_eq!(request.scopes, vec![CapabilityScope::GenerateText]);
        assert!(mediator.resolve(PromptDecision {
            prompt_id: request.prompt_id,
            decision: GrantDecision::AllowOnce,
            allowed_tools: None,
        }));
    });

    let _ = h.client.call("ai.prompt", None).await.unwrap();
    ui.await.unwrap();
    assert_eq!(
        h.gateway.store().status(&origin(), CapabilityScope::GenerateText).unwrap(),
        GrantStatus::GrantedOnce
    );
}

#[tokio::test]
async fn stream_without_terminal_event_gets_a_final() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store(), mediator, GatewayConfig::default());

    let stream = h.client.stream("ai.stream", None).unwrap();
    let items: Vec<_> = stream.collect().await;
    let events: Vec<StreamEvent> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        events,
        vec![
            StreamEvent::Token { text: "a".into() },
            StreamEvent::Token { text: "b".into() },
            StreamEvent::Final { output: Value::Null },
        ]
    );
}

#[tokio::test]
async fn refused_stream_surfaces_the_error() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::Deny));
    let h = start(store(), mediator, GatewayConfig::default());

    let mut stream = h.client.stream("ai.stream", None).unwrap();
    let first = stream.next().await.unwrap();
    assert_matches!(first, Err(CallError::Remote(body)) if body.code == "SCOPE_REQUIRED");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn abort_stops_the_producer() {
    let (dropped_tx, dropped_rx) = oneshot::channel();
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start_with(store(), mediator, GatewayConfig::default(), |registry| {
        registry.register(
            "ai.endless",
            &[CapabilityScope::GenerateText],
            Endless {
                dropped: Mutex::new(Some(dropped_tx)),
            },
        );
    });

    let mut stream = h.client.stream("ai.endless", None).unwrap();
    assert_matches!(stream.next().await, Some(Ok(StreamEvent::Token { text })) if text == "first");
    stream.abort();
    assert!(stream.next().await.is_none());

    tokio::time::timeout(Duration::from_secs(1), dropped_rx)
        .await
        .expect("producer was not dropped")
        .unwrap();
}

#[tokio::test]
async fn handler_panic_becomes_internal_error() {
    let h = start(store(), Arc::new(ScriptedMediator::default()), GatewayConfig::default());
    let err = h.client.call("agent.explode", None).await.unwrap_err();
    assert_eq!(remote_code(&err), "INTERNAL");

    // the session survives
    let pong = h.client.call("system.ping", None).await.unwrap();
    assert_eq!(pong["pong"], true);
}

#[tokio::test]
async fn permissions_request_prompts_for_missing_scopes_only() {
    let store = store();
    store
        .apply_decision(&origin(), &[CapabilityScope::ListTools], GrantDecision::AllowAlways, None, None)
        .unwrap();
    let (mediator, mut prompts) = ChannelMediator::new(8);
    let mediator = Arc::new(mediator);
    let h = start(store, mediator.clone(), GatewayConfig::default());

    let ui = tokio::spawn(async move {
        let request = prompts.recv().await.unwrap();
        assert_eq!(request.scopes, vec![CapabilityScope::ToolCall]);
        assert_eq!(request.reason.as_deref(), Some("search the docs"));
        assert_eq!(request.tools, Some(vec!["srv/search".to_string()]));
        let _ = mediator.resolve(PromptDecision {
            prompt_id: request.prompt_id,
            decision: GrantDecision::AllowAlways,
            allowed_tools: Some(vec!["srv/search".into()]),
        });
    });

    let result = h
        .client
        .request_permissions(
            &[CapabilityScope::ListTools, CapabilityScope::ToolCall],
            Some("search the docs"),
            Some(&["srv/search".to_string()]),
        )
        .await
        .unwrap();
    ui.await.unwrap();

    assert_eq!(result["granted"], true);
    assert_eq!(result["scopes"]["list-tools"], "granted-always");
    assert_eq!(result["scopes"]["tool-call"], "granted-always");
    assert_eq!(result["allowedTools"], json!(["srv/search"]));

    let record = h.client.call("permissions.list", None).await.unwrap();
    assert_eq!(record["origin"], ORIGIN);
    assert_eq!(record["scopes"]["tool-call"]["status"], "granted-always");
}

#[tokio::test]
async fn permissions_request_reports_denied_scopes_without_prompting() {
    let store = store();
    store
        .apply_decision(&origin(), &[CapabilityScope::WebFetch], GrantDecision::Deny, None, None)
        .unwrap();
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowAlways));
    let h = start(store, mediator.clone(), GatewayConfig::default());

    let result = h
        .client
        .request_permissions(&[CapabilityScope::WebFetch], None, None)
        .await
        .unwrap();
    assert_eq!(result["granted"], false);
    assert_eq!(result["scopes"]["web-fetch"], "denied");
    assert_eq!(mediator.prompt_count(), 0);
}

#[tokio::test]
async fn permissions_request_rejects_bad_payload() {
    let h = start(store(), Arc::new(ScriptedMediator::default()), GatewayConfig::default());
    let err = h
        .client
        .call("permissions.request", Some(json!({"scopes": ["teleport"]})))
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), "INVALID_PARAMS");
}

#[tokio::test]
async fn closing_the_channel_drops_once_grants() {
    let mediator = Arc::new(StaticMediator::new(GrantDecision::AllowOnce));
    let store = store();
    let h = start(store.clone(), mediator, GatewayConfig::default());

    let _ = h.client.call("ai.prompt", None).await.unwrap();
    assert_eq!(
        store.status(&origin(), CapabilityScope::GenerateText).unwrap(),
        GrantStatus::GrantedOnce
    );

    drop(h.client);
    tokio::time::timeout(Duration::from_secs(1), h.session)
        .await
        .expect("session did not end")
        .unwrap();
    assert_eq!(
        store.status(&origin(), CapabilityScope::GenerateText).unwrap(),
        GrantStatus::NotGranted
    );
}
