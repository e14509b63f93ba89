//! WebSocket transport adapter and per-connection driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use warden_core::{ConnectionId, Origin};
use warden_gateway::{ArbiterSession, CapabilityGateway};
use warden_transport::{
    ChannelConfig, FrameSink, FrameSource, InboundFrame, TransportError, arbiter_channel,
};

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long the writer may take to flush after the session ends.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Outbound half: queues text frames for the writer task.
#[derive(Clone, Debug)]
pub struct WsSink {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSink for WsSink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

/// Inbound half: text frames from the socket. Binary frames are accepted
/// when they hold UTF-8. Ends on close, read error, or server shutdown.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
    shutdown: CancellationToken,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<InboundFrame> {
        loop {
            let msg = tokio::select! {
                () = self.shutdown.cancelled() => return None,
                msg = self.stream.next() => msg?,
            };
            match msg {
                Ok(Message::Text(text)) => return Some(InboundFrame::direct(text.as_str())),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(InboundFrame::direct(text)),
                    Err(_) => debug!(len = data.len(), "non-UTF-8 binary frame dropped"),
                },
                Ok(Message::Close(_)) => {
                    debug!("client sent close frame");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    return None;
                }
            }
        }
    }
}

/// Run one WebSocket connection as an arbiter channel bound to `origin`.
///
/// Once-grants made on the connection are bound to `connection_id` and
/// dropped when it closes.
#[instrument(skip_all, fields(connection_id = %connection_id, origin = %origin))]
pub async fn run_ws_session(
    socket: WebSocket,
    origin: Origin,
    connection_id: ConnectionId,
    gateway: Arc<CapabilityGateway>,
    channel_tag: String,
    shutdown: CancellationToken,
) {
    let started = Instant::now();
    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let (ws_tx, ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx));

    let (sender, receiver) = arbiter_channel(
        WsSink { tx },
        WsSource {
            stream: ws_rx,
            shutdown,
        },
        ChannelConfig::new(channel_tag),
        origin,
    );
    ArbiterSession::new(gateway, sender, receiver)
        .with_context(connection_id.to_string())
        .run()
        .await;

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("writer did not drain in {WRITER_DRAIN:?}, dropping connection");
        writer.abort();
    }

    info!("client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
}

/// Forward queued frames to the socket, pinging periodically. Sends a close
/// frame once every sink is gone.
async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            text = rx.recv() => match text {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
