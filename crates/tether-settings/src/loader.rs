//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate cross-field constraints

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination
/// of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Reject settings the runtime cannot operate with.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    if settings.concurrency.max_concurrent == 0 {
        return Err(SettingsError::InvalidValue(
            "concurrency.maxConcurrent must be at least 1".into(),
        ));
    }
    if settings.response_queue.max_size == 0 {
        return Err(SettingsError::InvalidValue(
            "responseQueue.maxSize must be at least 1".into(),
        ));
    }
    if settings.link.heartbeat_interval_ms == 0 || settings.link.heartbeat_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "link heartbeat interval and timeout must be non-zero".into(),
        ));
    }
    if settings.tracker.sweep_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "tracker.sweepIntervalMs must be non-zero".into(),
        ));
    }
    if settings.link.outbound_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "link.outboundBuffer must be at least 1".into(),
        ));
    }
    if !settings.server.path.starts_with('/') || !settings.link.path.starts_with('/') {
        return Err(SettingsError::InvalidValue(
            "endpoint paths must start with '/'".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; invalid values are logged
/// and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    if let Some(v) = read_env_string("TETHER_HOST") {
        settings.server.host.clone_from(&v);
        settings.link.host = v;
    }
    if let Some(v) = read_env_u16("TETHER_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("TETHER_REQUEST_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.request_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.link.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_HEARTBEAT_TIMEOUT_MS", 100, 600_000) {
        settings.link.heartbeat_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_RECONNECT_INTERVAL_MS", 100, 600_000) {
        settings.link.reconnect_interval_ms = v;
    }
    if let Some(v) = read_env_usize("TETHER_MAX_CONCURRENT", 1, 1_024) {
        settings.concurrency.max_concurrent = v;
    }
    if let Some(v) = read_env_usize("TETHER_MAX_QUEUE_SIZE", 0, 1_000_000) {
        settings.concurrency.max_queue_size = v;
    }
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
