//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial
//! JSON is accepted; missing fields take the production defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_core::logging::LogFormat;

/// Root settings type.
///
/// ```json
/// {
///   "transport": { "defaultTimeoutMs": 15000 },
///   "permissions": { "onceGrantTtlSecs": 300 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenSettings {
    /// Settings schema version.
    pub version: String,
    /// Channel and call-deadline settings.
    pub transport: TransportSettings,
    /// Permission store and prompt settings.
    pub permissions: PermissionSettings,
    /// WebSocket host settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for WardenSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            transport: TransportSettings::default(),
            permissions: PermissionSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Channel and call-deadline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Tag stamped on every frame; frames with another tag are discarded.
    pub channel_tag: String,
    /// Deadline for ordinary calls.
    pub default_timeout_ms: u64,
    /// Deadline for calls that may show a permission prompt.
    pub prompt_timeout_ms: u64,
    /// Deadline for model-backed chat calls.
    pub chat_timeout_ms: u64,
    /// Deadline for container-backed provisioning calls.
    pub provision_timeout_ms: u64,
    /// Largest accepted frame, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            channel_tag: "warden".to_string(),
            default_timeout_ms: 30_000,
            prompt_timeout_ms: 120_000,
            chat_timeout_ms: 180_000,
            provision_timeout_ms: 300_000,
            max_frame_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Decision applied to permission prompts when no UI is attached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadlessDecision {
    /// Refuse every prompt.
    #[default]
    Deny,
    /// Grant for the once-grant TTL.
    AllowOnce,
    /// Grant until revoked.
    AllowAlways,
}

/// Permission store and prompt settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSettings {
    /// `SQLite` database path. Empty means `~/.warden/permissions.db`.
    pub db_path: String,
    /// Lifetime of an allow-once grant.
    pub once_grant_ttl_secs: u64,
    /// How long to wait for a prompt decision before treating it as a deny.
    pub prompt_wait_ms: u64,
    /// Decision used by headless arbiters.
    pub headless_decision: HeadlessDecision,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            once_grant_ttl_secs: 600,
            prompt_wait_ms: 120_000,
            headless_decision: HeadlessDecision::Deny,
        }
    }
}

/// WebSocket host settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Maximum concurrent channels.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9137,
            max_connections: 32,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl TransportSettings {
    /// Deadline for ordinary calls.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
    /// Deadline for calls that may prompt.
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }
    /// Deadline for chat calls.
    pub fn chat_timeout(&self) -> Duration {
        Duration::from_millis(self.chat_timeout_ms)
    }
    /// Deadline for provisioning calls.
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }
}

impl PermissionSettings {
    /// Lifetime of an allow-once grant.
    pub fn once_grant_ttl(&self) -> Duration {
        Duration::from_secs(self.once_grant_ttl_secs)
    }
    /// Bound on waiting for a prompt decision.
    pub fn prompt_wait(&self) -> Duration {
        Duration::from_millis(self.prompt_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = WardenSettings::default();
        assert_eq!(s.transport.channel_tag, "warden");
        assert_eq!(s.transport.default_timeout(), Duration::from_secs(30));
        assert_eq!(s.transport.prompt_timeout(), Duration::from_secs(120));
        assert_eq!(s.transport.chat_timeout(), Duration::from_secs(180));
        assert_eq!(s.transport.provision_timeout(), Duration::from_secs(300));
        assert_eq!(s.transport.max_frame_bytes, 10 * 1024 * 1024);
        assert_eq!(s.permissions.once_grant_ttl(), Duration::from_secs(600));
        assert_eq!(s.permissions.headless_decision, HeadlessDecision::Deny);
        assert_eq!(s.server.port, 9137);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: WardenSettings =
            serde_json::from_str(r#"{"transport": {"defaultTimeoutMs": 5000}}"#).unwrap();
        assert_eq!(s.transport.default_timeout_ms, 5000);
        assert_eq!(s.transport.prompt_timeout_ms, 120_000);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    #[test]
    fn camel_case_wire_names() {
        let v = serde_json::to_value(WardenSettings::default()).unwrap();
        assert!(v["permissions"].get("onceGrantTtlSecs").is_some());
        assert_eq!(v["permissions"]["headlessDecision"], "deny");
        assert!(v["transport"].get("maxFrameBytes").is_some());
    }
}
