//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{HeadlessDecision, WardenSettings};

/// Directory holding the settings file and the default database.
pub fn warden_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".warden")
}

/// Resolve the path to the settings file (`~/.warden/settings.json`).
pub fn settings_path() -> PathBuf {
    warden_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<WardenSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<WardenSettings> {
    let defaults = serde_json::to_value(WardenSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: WardenSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Resolve the permission database path, applying the `~/.warden` default.
pub fn permission_db_path(settings: &WardenSettings) -> PathBuf {
    if settings.permissions.db_path.is_empty() {
        warden_home().join("permissions.db")
    } else {
        PathBuf::from(&settings.permissions.db_path)
    }
}

/// Accepted once-grant lifetimes, from the file or the environment.
const ONCE_GRANT_TTL_SECS: RangeInclusive<u64> = 1..=86_400 * 30;

fn validate(settings: &WardenSettings) -> Result<()> {
    if settings.transport.channel_tag.is_empty() {
        return Err(SettingsError::InvalidValue(
            "transport.channelTag must not be empty".into(),
        ));
    }
    if settings.transport.default_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "transport.defaultTimeoutMs must be positive".into(),
        ));
    }
    if !ONCE_GRANT_TTL_SECS.contains(&settings.permissions.once_grant_ttl_secs) {
        return Err(SettingsError::InvalidValue(format!(
            "permissions.onceGrantTtlSecs must be within {}..={}",
            ONCE_GRANT_TTL_SECS.start(),
            ONCE_GRANT_TTL_SECS.end()
        )));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut WardenSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("WARDEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_in_range::<u16>("WARDEN_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_in_range::<usize>("WARDEN_MAX_CONNECTIONS", 1, 10_000) {
        settings.server.max_connections = v;
    }

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = read_env_in_range::<u64>("WARDEN_DEFAULT_TIMEOUT_MS", 100, 3_600_000) {
        settings.transport.default_timeout_ms = v;
    }

    // ── Permissions ─────────────────────────────────────────────────
    if let Some(v) = read_env_string("WARDEN_DB_PATH") {
        settings.permissions.db_path = v;
    }
    if let Some(v) = read_env_in_range(
        "WARDEN_ONCE_GRANT_TTL_SECS",
        *ONCE_GRANT_TTL_SECS.start(),
        *ONCE_GRANT_TTL_SECS.end(),
    ) {
        settings.permissions.once_grant_ttl_secs = v;
    }
    if let Some(v) = read_env_in_range::<u64>("WARDEN_PROMPT_WAIT_MS", 1000, 3_600_000) {
        settings.permissions.prompt_wait_ms = v;
    }
    if let Some(v) = read_env_string("WARDEN_HEADLESS_DECISION") {
        match parse_headless_decision(&v) {
            Some(decision) => settings.permissions.headless_decision = decision,
            None => tracing::warn!(value = %v, "invalid WARDEN_HEADLESS_DECISION, ignoring"),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("WARDEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a headless decision token (`deny`, `allow-once`, `allow-always`).
pub fn parse_headless_decision(val: &str) -> Option<HeadlessDecision> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}

/// Parse `val` as a `T` and keep it only when it lies in `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.parse().ok().filter(|n| (min..=max).contains(n))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_in_range<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let val = std::env::var(name).ok()?;
    let parsed = parse_in_range(&val, min, max);
    if parsed.is_none() {
        tracing::warn!(key = name, value = %val, "env override out of range ({min}..={max}), ignoring");
    }
    parsed
}
