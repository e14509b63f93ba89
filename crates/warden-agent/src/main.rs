//! # warden-agent
//!
//! Arbiter binary. Loads settings, opens the durable permission store, and
//! serves either a WebSocket host or a single native-messaging channel over
//! stdin/stdout.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use warden_core::{ConnectionId, Origin, logging};
use warden_gateway::{ArbiterSession, CapabilityGateway, CapabilityRegistry, GatewayConfig, StaticMediator};
use warden_permissions::{PermissionStore, SqliteGrantRepository, SystemClock};
use warden_server::WardenServer;
use warden_settings::WardenSettings;
use warden_transport::{ChannelConfig, arbiter_channel, native_port};

/// Warden capability arbiter.
#[derive(Parser, Debug)]
#[command(name = "warden-agent", about = "Warden capability arbiter")]
struct Cli {
    /// Serve one channel over stdin/stdout using native-messaging framing.
    /// The value is the caller's origin.
    #[arg(long, value_name = "CALLER_ORIGIN", num_args = 0..=1)]
    native_messaging: Option<Option<String>>,

    /// Caller origin as passed positionally by a browser launching a native
    /// host. Implies `--native-messaging`.
    #[arg(value_name = "CALLER_ORIGIN")]
    caller_origin: Option<String>,

    /// Settings file (defaults to `~/.warden/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Permission database path (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,
}

/// How the arbiter is reached.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    WebSocket,
    Native(Origin),
}

impl Cli {
    fn mode(&self) -> Result<Mode> {
        let raw = match (&self.native_messaging, &self.caller_origin) {
            (Some(Some(origin)), _) | (_, Some(origin)) => origin,
            (Some(None), None) => bail!("--native-messaging requires the caller origin"),
            (None, None) => return Ok(Mode::WebSocket),
        };
        let origin = Origin::parse(raw).with_context(|| format!("Invalid caller origin: {raw}"))?;
        Ok(Mode::Native(origin))
    }

    fn apply_overrides(&self, settings: &mut WardenSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.permissions.db_path = path.to_string_lossy().into_owned();
        }
    }
}

/// Durable store plus gateway. Headless prompts resolve with the configured
/// automatic decision.
fn build_gateway(settings: &WardenSettings) -> Result<Arc<CapabilityGateway>> {
    let db_path = warden_settings::permission_db_path(settings);
    let repo = SqliteGrantRepository::open(&db_path)
        .with_context(|| format!("Failed to open permission database: {}", db_path.display()))?;
    let store = PermissionStore::new(
        Arc::new(repo),
        Arc::new(SystemClock),
        settings.permissions.once_grant_ttl(),
    );
    let mediator = StaticMediator::from_headless(settings.permissions.headless_decision);
    tracing::info!(
        db = %db_path.display(),
        headless_decision = ?settings.permissions.headless_decision,
        "permission store opened"
    );
    Ok(Arc::new(CapabilityGateway::new(
        CapabilityRegistry::new(),
        store,
        Arc::new(mediator),
        GatewayConfig::from_settings(&settings.permissions),
    )))
}

async fn serve_native(settings: &WardenSettings, gateway: Arc<CapabilityGateway>, origin: Origin) {
    tracing::info!(%origin, "serving native-messaging channel on stdio");
    let (sink, source) = native_port(
        tokio::io::stdin(),
        tokio::io::stdout(),
        settings.transport.max_frame_bytes,
    );
    let (sender, receiver) = arbiter_channel(
        sink,
        source,
        ChannelConfig::new(settings.transport.channel_tag.clone()),
        origin,
    );
    ArbiterSession::new(gateway, sender, receiver)
        .with_context(ConnectionId::new().to_string())
        .run()
        .await;
}

async fn serve_websocket(settings: &WardenSettings, gateway: Arc<CapabilityGateway>) -> Result<()> {
    let capability_count = gateway.capabilities().len();
    let server = WardenServer::new(settings, gateway);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Warden arbiter listening on ws://{addr}/ws ({capability_count} capabilities)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown();
    let _ = handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(warden_settings::settings_path);
    let mut settings = warden_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply_overrides(&mut settings);

    logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let mode = args.mode()?;
    let gateway = build_gateway(&settings)?;

    match mode {
        Mode::Native(origin) => {
            serve_native(&settings, gateway, origin).await;
            Ok(())
        }
        Mode::WebSocket => serve_websocket(&settings, gateway).await,
    }
}
