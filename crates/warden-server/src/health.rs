//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket channels.
    pub connections: usize,
    /// Registered capabilities, built-ins included.
    pub capabilities: Vec<String>,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, capabilities: Vec<String>) -> HealthResponse {
    HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        capabilities,
    }
}
