//! Caller-side capability client.
//!
//! [`CapabilityClient`] is a cheap handle onto a driver task that owns the
//! channel's [`CorrelationTable`] and stream sessions. Handles talk to the
//! driver through a command queue, so the tables are only ever touched by one
//! task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, instrument, warn};
use warden_core::{
    AbortEnvelope, ArbiterEnvelope, CallerEnvelope, CapabilityScope, RequestEnvelope, RequestId,
    ResponseEnvelope, StreamEvent, StreamEventEnvelope,
};
use warden_settings::TransportSettings;

use crate::adapter::{FrameSink, FrameSource};
use crate::channel::{ChannelConfig, EnvelopeReceiver, EnvelopeSender, caller_channel};
use crate::correlation::{CorrelationTable, Reply, Resolution};
use crate::errors::{CallError, TransportError};
use crate::stream::{EventSender, EventStream, StreamSessions};

/// Stand-in deadline for timeouts too large to represent as an instant.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deadline class of a capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CallClass {
    /// Ordinary calls.
    #[default]
    Default,
    /// Calls that may block on a permission prompt.
    Prompt,
    /// Model-backed chat.
    Chat,
    /// Container-backed provisioning.
    Provision,
}

/// Deadline per [`CallClass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallTimeouts {
    /// [`CallClass::Default`].
    pub default: Duration,
    /// [`CallClass::Prompt`].
    pub prompt: Duration,
    /// [`CallClass::Chat`].
    pub chat: Duration,
    /// [`CallClass::Provision`].
    pub provision: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            prompt: Duration::from_secs(120),
            chat: Duration::from_secs(180),
            provision: Duration::from_secs(300),
        }
    }
}

impl CallTimeouts {
    /// Deadline for `class`.
    pub fn for_class(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Default => self.default,
            CallClass::Prompt => self.prompt,
            CallClass::Chat => self.chat,
            CallClass::Provision => self.provision,
        }
    }
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Channel tag.
    pub channel_tag: String,
    /// Deadline per class.
    pub timeouts: CallTimeouts,
    classes: HashMap<String, CallClass>,
}

impl ClientConfig {
    /// Default deadlines; `permissions.request` is a prompt-class call.
    pub fn new(channel_tag: impl Into<String>) -> Self {
        Self {
            channel_tag: channel_tag.into(),
            timeouts: CallTimeouts::default(),
            classes: HashMap::new(),
        }
        .with_class("permissions.request", CallClass::Prompt)
    }

    /// Deadlines and tag from loaded settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        let mut config = Self::new(settings.channel_tag.clone());
        config.timeouts = CallTimeouts {
            default: settings.default_timeout(),
            prompt: settings.prompt_timeout(),
            chat: settings.chat_timeout(),
            provision: settings.provision_timeout(),
        };
        config
    }

    /// Assign `capability` to `class`.
    #[must_use]
    pub fn with_class(mut self, capability: impl Into<String>, class: CallClass) -> Self {
        let _ = self.classes.insert(capability.into(), class);
        self
    }

    /// Class of `capability`.
    pub fn class_of(&self, capability: &str) -> CallClass {
        self.classes.get(capability).copied().unwrap_or_default()
    }

    /// Deadline applied to `capability` when the caller gives none.
    pub fn timeout_for(&self, capability: &str) -> Duration {
        self.timeouts.for_class(self.class_of(capability))
    }
}

/// Snapshot of the driver's tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Outstanding correlated calls.
    pub pending_calls: usize,
    /// Open stream sessions.
    pub active_streams: usize,
    /// Whether the channel is still open.
    pub connected: bool,
}

#[derive(Debug)]
pub(crate) enum Command {
    Call {
        request: RequestEnvelope,
        deadline: Instant,
        reply: Reply,
    },
    Forget(RequestId),
    Stream {
        request: RequestEnvelope,
        events: EventSender,
    },
    Abort(RequestId),
    Stats(oneshot::Sender<ClientStats>),
}

/// Handle for issuing capability calls over one channel.
#[derive(Clone, Debug)]
pub struct CapabilityClient {
    commands: mpsc::UnboundedSender<Command>,
    config: Arc<ClientConfig>,
}

impl CapabilityClient {
    /// Open a caller channel over a transport and start its driver.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
        channel: ChannelConfig,
        config: ClientConfig,
    ) -> Self {
        let (sender, receiver) = caller_channel(sink, source, channel);
        Self::spawn(sender, receiver, config)
    }

    /// Start a driver over an already-typed channel.
    pub fn spawn(
        sender: EnvelopeSender<CallerEnvelope>,
        receiver: EnvelopeReceiver<ArbiterEnvelope>,
        config: ClientConfig,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = ClientDriver {
            sender,
            receiver,
            commands: rx,
            table: CorrelationTable::new(),
            streams: StreamSessions::default(),
            connected: true,
        };
        let _ = tokio::spawn(driver.run());
        Self {
            commands,
            config: Arc::new(config),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Call `capability` with its class deadline.
    pub async fn call(&self, capability: &str, payload: Option<Value>) -> Result<Value, CallError> {
        let timeout = self.config.timeout_for(capability);
        self.call_with_timeout(capability, payload, timeout).await
    }

    /// Call `capability`, rejecting with [`CallError::Timeout`] if no
    /// response arrives within `timeout`.
    pub async fn call_with_timeout(
        &self,
        capability: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = RequestId::new();
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + UNBOUNDED_WAIT);
        let waited = deadline.saturating_duration_since(now);
        let (reply, rx) = oneshot::channel();
        let request = RequestEnvelope {
            id: id.clone(),
            capability: capability.to_owned(),
            payload,
        };
        self.commands
            .send(Command::Call {
                request,
                deadline,
                reply,
            })
            .map_err(|_| CallError::ConnectionLost)?;

        let mut guard = ForgetOnDrop {
            id: Some(id),
            commands: &self.commands,
        };
        match timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(CallError::ConnectionLost)
            }
            Err(_) => Err(CallError::Timeout {
                capability: capability.to_owned(),
                timeout_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Begin a streaming call. The session is registered before the request
    /// is posted.
    pub fn stream(&self, capability: &str, payload: Option<Value>) -> Result<EventStream, CallError> {
        let id = RequestId::new();
        let (events, rx) = mpsc::unbounded_channel();
        let request = RequestEnvelope {
            id: id.clone(),
            capability: capability.to_owned(),
            payload,
        };
        self.commands
            .send(Command::Stream { request, events })
            .map_err(|_| CallError::ConnectionLost)?;
        Ok(EventStream::new(id, rx, self.commands.clone()))
    }

    /// Ask the arbiter to grant `scopes` (and optionally restrict tools).
    pub async fn request_permissions(
        &self,
        scopes: &[CapabilityScope],
        reason: Option<&str>,
        tools: Option<&[String]>,
    ) -> Result<Value, CallError> {
        let mut payload = json!({ "scopes": scopes });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        if let Some(tools) = tools {
            payload["tools"] = json!(tools);
        }
        self.call("permissions.request", Some(payload)).await
    }

    /// Current table sizes, or `None` if the driver has stopped.
    pub async fn stats(&self) -> Option<ClientStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }
}

/// Removes a call's table entry when its future is dropped or times out.
struct ForgetOnDrop<'a> {
    id: Option<RequestId>,
    commands: &'a mpsc::UnboundedSender<Command>,
}

impl ForgetOnDrop<'_> {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.commands.send(Command::Forget(id));
        }
    }
}

struct ClientDriver {
    sender: EnvelopeSender<CallerEnvelope>,
    receiver: EnvelopeReceiver<ArbiterEnvelope>,
    commands: mpsc::UnboundedReceiver<Command>,
    table: CorrelationTable,
    streams: StreamSessions,
    connected: bool,
}

impl ClientDriver {
    #[instrument(skip_all)]
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                inbound = self.receiver.recv(), if self.connected => match inbound {
                    Some(envelope) => self.handle_inbound(envelope),
                    None => self.disconnect(),
                },
            }
        }
        debug!("client driver stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call {
                request,
                deadline,
                reply,
            } => {
                if !self.connected {
                    let _ = reply.send(Err(CallError::ConnectionLost));
                    return;
                }
                let id = request.id.clone();
                self.table
                    .register(id.clone(), request.capability.clone(), deadline, reply);
                if let Err(e) = self.sender.send(CallerEnvelope::Request(request)) {
                    let _ = self.table.resolve(&id, Err(send_error(e)), Instant::now());
                }
            }
            Command::Forget(id) => {
                if self.table.forget(&id) {
                    debug!(%id, "call abandoned before response");
                }
            }
            Command::Stream { request, events } => {
                if !self.connected {
                    let _ = events.send(Err(CallError::ConnectionLost));
                    return;
                }
                let id = request.id.clone();
                self.streams.insert(id.clone(), events);
                if let Err(e) = self.sender.send(CallerEnvelope::Request(request)) {
                    let _ = self.streams.deliver(&id, Err(send_error(e)), true);
                }
            }
            Command::Abort(id) => {
                if self.streams.remove(&id) && self.connected {
                    if let Err(e) = self.sender.send(CallerEnvelope::Abort(AbortEnvelope { id })) {
                        debug!(error = %e, "abort not delivered");
                    }
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(ClientStats {
                    pending_calls: self.table.len(),
                    active_streams: self.streams.len(),
                    connected: self.connected,
                });
            }
        }
    }

    fn handle_inbound(&mut self, envelope: ArbiterEnvelope) {
        match envelope {
            ArbiterEnvelope::Response(response) => self.on_response(response),
            ArbiterEnvelope::StreamEvent(event) => self.on_stream_event(event),
        }
    }

    fn on_response(&mut self, response: ResponseEnvelope) {
        let id = response.id.clone();
        if self.table.contains(&id) {
            let outcome = response.into_result().map_err(CallError::Remote);
            if self.table.resolve(&id, outcome, Instant::now()) == Resolution::Expired {
                debug!(%id, "response arrived after deadline");
            }
            return;
        }
        if self.streams.contains(&id) {
            // a stream refused before its handler ran, or answered with a plain value
            let item = match response.into_result() {
                Ok(output) => Ok(StreamEvent::Final { output }),
                Err(body) => Err(CallError::Remote(body)),
            };
            let _ = self.streams.deliver(&id, item, true);
            return;
        }
        debug!(%id, "late or unknown response dropped");
    }

    fn on_stream_event(&mut self, envelope: StreamEventEnvelope) {
        let last = envelope.is_terminal();
        let id = envelope.id;
        if !self.streams.deliver(&id, Ok(envelope.event), last) {
            debug!(%id, "event for finished or aborted stream dropped");
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        let calls = self.table.reject_all(&CallError::ConnectionLost);
        let streams = self.streams.fail_all(&CallError::ConnectionLost);
        if calls + streams > 0 {
            warn!(calls, streams, "channel closed with work outstanding");
        } else {
            debug!("channel closed");
        }
    }
}

fn send_error(err: TransportError) -> CallError {
    match err {
        TransportError::Encode(e) => CallError::Encode(e.to_string()),
        other @ TransportError::FrameTooLarge { .. } => CallError::Encode(other.to_string()),
        TransportError::Closed | TransportError::Io(_) => CallError::ConnectionLost,
    }
}
