//! `WardenServer`: Axum HTTP + WebSocket host for the arbiter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use warden_core::{ConnectionId, Origin};
use warden_gateway::CapabilityGateway;
use warden_settings::{ServerSettings, WardenSettings};

use crate::health::{self, HealthResponse};
use crate::websocket::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch and permission enforcement.
    pub gateway: Arc<CapabilityGateway>,
    /// Tag stamped on every frame.
    pub channel_tag: String,
    /// Largest accepted WebSocket message.
    pub max_frame_bytes: usize,
    /// One permit per open channel.
    pub connections: Arc<Semaphore>,
    /// Size of the connection pool.
    pub max_connections: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Cancelled on shutdown; ends every open channel.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Open WebSocket channels.
    pub fn connection_count(&self) -> usize {
        self.max_connections
            .saturating_sub(self.connections.available_permits())
    }
}

/// The WebSocket host.
pub struct WardenServer {
    settings: ServerSettings,
    state: AppState,
}

impl WardenServer {
    /// Server over `gateway`, configured from loaded settings.
    pub fn new(settings: &WardenSettings, gateway: Arc<CapabilityGateway>) -> Self {
        let state = AppState {
            gateway,
            channel_tag: settings.transport.channel_tag.clone(),
            max_frame_bytes: settings.transport.max_frame_bytes,
            connections: Arc::new(Semaphore::new(settings.server.max_connections)),
            max_connections: settings.server.max_connections,
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        };
        Self {
            settings: settings.server.clone(),
            state,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Open WebSocket channels.
    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Stop accepting connections and close every open channel.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    /// Bind and serve in the background. Port `0` picks a free port.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.settings.host.as_str(), self.settings.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "warden server listening");

        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
            info!("warden server stopped");
        });
        Ok((addr, handle))
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connection_count(),
        state.gateway.capabilities(),
    ))
}

/// GET /ws
///
/// The `Origin` header is mandatory: it is the identity every request on
/// the connection is attributed to.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| Origin::parse(raw).ok());
    let Some(origin) = origin else {
        counter!("ws_rejections_total", "reason" => "origin").increment(1);
        debug!("upgrade refused: missing or invalid Origin header");
        return (StatusCode::FORBIDDEN, "a valid Origin header is required").into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        counter!("ws_rejections_total", "reason" => "capacity").increment(1);
        warn!(max = state.max_connections, %origin, "connection limit reached");
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };

    let connection_id = ConnectionId::new();
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            run_ws_session(
                socket,
                origin,
                connection_id,
                state.gateway,
                state.channel_tag,
                state.shutdown.child_token(),
            )
            .await;
            drop(permit);
        })
}
