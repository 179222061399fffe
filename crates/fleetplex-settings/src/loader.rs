//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FleetplexSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `FLEETPLEX_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::FleetplexSettings;

/// Resolve the path to the settings file (`~/.fleetplex/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".fleetplex").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FleetplexSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<FleetplexSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Read and merge the settings file without consulting the environment.
pub fn read_settings_file(path: &Path) -> Result<FleetplexSettings> {
    let defaults = serde_json::to_value(FleetplexSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Check cross-field constraints that serde cannot express.
pub fn validate(settings: &FleetplexSettings) -> Result<()> {
    let dir = &settings.spool.dir;
    if dir.as_os_str().is_empty() || dir.to_str().is_some_and(|d| d.trim().is_empty()) {
        return Err(SettingsError::InvalidValue("spool.dir is empty".into()));
    }
    if settings.server.heartbeat_timeout_secs < settings.server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(format!(
            "server.heartbeatTimeoutSecs ({}) is shorter than server.heartbeatIntervalSecs ({})",
            settings.server.heartbeat_timeout_secs, settings.server.heartbeat_interval_secs
        )));
    }
    if settings.server.max_connections == 0 {
        return Err(SettingsError::InvalidValue(
            "server.maxConnections must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply `FLEETPLEX_*` environment variable overrides.
///
/// Invalid values are logged and ignored (file/default value stays).
pub fn apply_env_overrides(settings: &mut FleetplexSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
    // Paths need not be UTF-8.
    if let Some(dir) = std::env::var_os("FLEETPLEX_SPOOL_DIR").filter(|v| !v.is_empty()) {
        settings.spool.dir = PathBuf::from(dir);
    }
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides(settings: &mut FleetplexSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("FLEETPLEX_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("FLEETPLEX_PORT") {
        if let Some(port) = checked("FLEETPLEX_PORT", &v, |s| parse_u16_range(s, 1, 65535)) {
            settings.server.port = port;
        }
    }
    if let Some(v) = read("FLEETPLEX_MAX_CONNECTIONS") {
        if let Some(n) = checked("FLEETPLEX_MAX_CONNECTIONS", &v, |s| {
            parse_usize_range(s, 1, 100_000)
        }) {
            settings.server.max_connections = n;
        }
    }
    if let Some(v) = read("FLEETPLEX_COMMAND_TIMEOUT_SECS") {
        if let Some(n) = checked("FLEETPLEX_COMMAND_TIMEOUT_SECS", &v, |s| {
            parse_u64_range(s, 1, 86_400)
        }) {
            settings.server.command_timeout_secs = n;
        }
    }

    // ── Spool ───────────────────────────────────────────────────────
    if let Some(v) = read("FLEETPLEX_SPOOL_DIR") {
        settings.spool.dir = PathBuf::from(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("FLEETPLEX_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("FLEETPLEX_LOG_JSON") {
        if let Some(b) = checked("FLEETPLEX_LOG_JSON", &v, parse_bool) {
            settings.logging.json = b;
        }
    }
}

fn checked<T>(name: &str, val: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

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
