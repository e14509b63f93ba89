//! Arbiter session: the lifecycle of one channel on the arbiter side.
//!
//! Requests are served concurrently, each on its own task with a
//! cancellation token. An `abort` fires the token of its request; closing
//! the channel fires all of them and drops the once-grants bound to the
//! session's context.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use warden_core::errors::INTERNAL;
use warden_core::{
    ArbiterEnvelope, ErrorBody, RequestEnvelope, RequestId, ResponseEnvelope, StreamEvent,
    StreamEventEnvelope,
};
use warden_transport::{ArbiterInbound, ArbiterReceiver, EnvelopeSender};

use crate::gateway::CapabilityGateway;
use crate::handler::{CallContext, HandlerOutput};

/// Serves one arbiter channel until it closes.
pub struct ArbiterSession {
    gateway: Arc<CapabilityGateway>,
    sender: EnvelopeSender<ArbiterEnvelope>,
    receiver: ArbiterReceiver,
    context: Option<String>,
}

impl ArbiterSession {
    /// Session over an arbiter channel.
    pub fn new(
        gateway: Arc<CapabilityGateway>,
        sender: EnvelopeSender<ArbiterEnvelope>,
        receiver: ArbiterReceiver,
    ) -> Self {
        Self {
            gateway,
            sender,
            receiver,
            context: None,
        }
    }

    /// Bind once-grants made on this channel to `context`; they are dropped
    /// when the session ends.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Run until the channel closes.
    #[instrument(skip_all, fields(origin = %self.receiver.origin()))]
    pub async fn run(mut self) {
        let session_cancel = CancellationToken::new();
        let mut inflight: HashMap<RequestId, CancellationToken> = HashMap::new();
        let mut tasks: JoinSet<RequestId> = JoinSet::new();

        info!(context = ?self.context, "arbiter session started");
        gauge!("arbiter_sessions_active").increment(1.0);

        loop {
            tokio::select! {
                inbound = self.receiver.recv() => match inbound {
                    Some(ArbiterInbound::Request { origin, request }) => {
                        if inflight.contains_key(&request.id) {
                            debug!(id = %request.id, "duplicate request id, ignoring");
                            continue;
                        }
                        let cancel = session_cancel.child_token();
                        let _ = inflight.insert(request.id.clone(), cancel.clone());
                        let ctx = CallContext {
                            origin,
                            request_id: request.id.clone(),
                            context: self.context.clone(),
                            cancel,
                        };
                        let _ = tasks.spawn(serve_guarded(
                            Arc::clone(&self.gateway),
                            self.sender.clone(),
                            ctx,
                            request,
                        ));
                    }
                    Some(ArbiterInbound::Abort(id)) => match inflight.get(&id) {
                        Some(token) => {
                            debug!(%id, "abort requested");
                            token.cancel();
                        }
                        None => debug!(%id, "abort for unknown request, ignoring"),
                    },
                    None => break,
                },
                Some(joined) = tasks.join_next() => match joined {
                    Ok(id) => {
                        let _ = inflight.remove(&id);
                    }
                    Err(e) => warn!(error = %e, "request task failed"),
                },
            }
        }

        session_cancel.cancel();
        tasks.shutdown().await;
        gauge!("arbiter_sessions_active").decrement(1.0);

        if let Some(context) = self.context.take() {
            let store = self.gateway.store().clone();
            match tokio::task::spawn_blocking(move || store.context_closed(&context)).await {
                Ok(Ok(removed)) => debug!(removed, "context closed"),
                Ok(Err(e)) => warn!(error = %e, "failed to drop context-bound grants"),
                Err(e) => warn!(error = %e, "context cleanup task failed"),
            }
        }
        info!("arbiter session ended");
    }
}

/// Serve one request, converting a handler panic into an `INTERNAL` error.
async fn serve_guarded(
    gateway: Arc<CapabilityGateway>,
    sender: EnvelopeSender<ArbiterEnvelope>,
    ctx: CallContext,
    request: RequestEnvelope,
) -> RequestId {
    let id = request.id.clone();
    let capability = request.capability.clone();
    let mut streaming = false;

    let outcome = AssertUnwindSafe(serve_request(&gateway, &sender, &ctx, request, &mut streaming))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        counter!("capability_panics_total", "capability" => capability.clone()).increment(1);
        warn!(%id, capability, "handler panicked");
        let error = ErrorBody::new(INTERNAL, format!("handler for '{capability}' panicked"));
        let envelope = if streaming {
            ArbiterEnvelope::StreamEvent(StreamEventEnvelope::new(id.clone(), StreamEvent::Error { error }))
        } else {
            ArbiterEnvelope::Response(ResponseEnvelope::failure(id.clone(), error))
        };
        let _ = send(&sender, envelope);
    }
    id
}

async fn serve_request(
    gateway: &CapabilityGateway,
    sender: &EnvelopeSender<ArbiterEnvelope>,
    ctx: &CallContext,
    request: RequestEnvelope,
    streaming: &mut bool,
) {
    let RequestEnvelope {
        id,
        capability,
        payload,
    } = request;

    let output = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => {
            debug!(%id, capability, "request cancelled before it completed");
            return;
        }
        output = gateway.dispatch(ctx, &capability, payload) => output,
    };

    match output {
        Ok(HandlerOutput::Value(result)) => {
            let _ = send(sender, ArbiterEnvelope::Response(ResponseEnvelope::success(id, result)));
        }
        Ok(HandlerOutput::Stream(events)) => {
            *streaming = true;
            pump(sender, ctx, id, events).await;
        }
        Err(err) => {
            let body = err.to_error_body();
            let _ = send(sender, ArbiterEnvelope::Response(ResponseEnvelope::failure(id, body)));
        }
    }
}

/// Forward stream events until a terminal event, an abort, or the end of
/// the producer. A producer that ends without a terminal event gets a
/// synthetic `final`.
async fn pump(
    sender: &EnvelopeSender<ArbiterEnvelope>,
    ctx: &CallContext,
    id: RequestId,
    mut events: BoxStream<'static, StreamEvent>,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                debug!(%id, "stream aborted");
                return;
            }
            next = events.next() => next,
        };
        let Some(event) = next else { break };

        let terminal = event.is_terminal();
        let envelope = ArbiterEnvelope::StreamEvent(StreamEventEnvelope::new(id.clone(), event));
        if !send(sender, envelope) || terminal {
            return;
        }
    }

    debug!(%id, "stream ended without a terminal event");
    let _ = send(
        sender,
        ArbiterEnvelope::StreamEvent(StreamEventEnvelope::new(id, StreamEvent::final_output(Value::Null))),
    );
}

fn send(sender: &EnvelopeSender<ArbiterEnvelope>, envelope: ArbiterEnvelope) -> bool {
    match sender.send(envelope) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "failed to send envelope");
            false
        }
    }
}
