//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TidalSettings::default()`]
//! 2. If `~/.tidal/settings.json` exists, deep-merge its values over defaults
//! 3. Apply `TIDAL_*` overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::TidalSettings;

/// Resolve the path to the settings file (`~/.tidal/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tidal").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TidalSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TidalSettings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Load settings from `path`, resolving overrides through `lookup`.
pub fn load_settings_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TidalSettings> {
    let defaults = serde_json::to_value(TidalSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TidalSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
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

/// Apply `TIDAL_*` overrides resolved through `lookup`.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides(settings: &mut TidalSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Overrides { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TIDAL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.ranged::<u16>("TIDAL_PORT", 0, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TIDAL_PATH") {
        settings.server.path = v;
    }
    if let Some(v) = env.string("TIDAL_TRANSPORTS") {
        settings.server.transports = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(v) = env.ranged::<u64>("TIDAL_PING_INTERVAL_MS", 100, 3_600_000) {
        settings.server.ping_interval_ms = v;
    }
    if let Some(v) = env.ranged::<u64>("TIDAL_PING_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.ping_timeout_ms = v;
    }
    if let Some(v) = env.ranged::<usize>("TIDAL_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.boolean("TIDAL_ALLOW_UPGRADES") {
        settings.server.allow_upgrades = v;
    }
    if let Some(v) = env.raw("TIDAL_COOKIE") {
        settings.server.cookie = v;
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = env.boolean("TIDAL_CLUSTER_ENABLED") {
        settings.cluster.enabled = v;
    }
    if let Some(v) = env.string("TIDAL_REDIS_URL") {
        settings.cluster.redis_url = Some(v);
    }
    if let Some(v) = env.string("TIDAL_CLUSTER_CHANNEL") {
        settings.cluster.channel = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TIDAL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.boolean("TIDAL_LOG_JSON") {
        settings.logging.json = v;
    }
}

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

/// Parse a number and check it against an inclusive range.
pub fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    /// Raw value, including empty strings.
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key).filter(|v| !v.is_empty())
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        let val = self.raw(key)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key, value = %val, "invalid boolean override, ignoring");
        }
        result
    }

    fn ranged<T: std::str::FromStr + PartialOrd>(&self, key: &str, min: T, max: T) -> Option<T> {
        let val = self.raw(key)?;
        let result = parse_range(&val, min, max);
        if result.is_none() {
            warn!(key, value = %val, "invalid numeric override, ignoring");
        }
        result
    }
}
