//! Settings loading with deep merge and environment overrides.
//!
//! 1. Serialize [`ConduitSettings::default()`] to JSON
//! 2. Deep-merge the settings file over it, if the file exists
//! 3. Deserialize, then apply `CONDUIT_*` environment overrides
//! 4. Validate the result
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced,
//! `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::ConduitSettings;

/// Default settings file: `~/.conduit/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conduit").join("settings.json")
}

/// Load from the default path.
pub fn load_settings() -> Result<ConduitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path`, falling back to defaults when the file is absent.
pub fn load_settings_from_path(path: &Path) -> Result<ConduitSettings> {
    let defaults = serde_json::to_value(ConduitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let file: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, file)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };

    let mut settings: ConduitSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Merge `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut ConduitSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
///
/// Unparseable or out-of-range values are logged and ignored.
pub fn apply_overrides(settings: &mut ConduitSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("CONDUIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("CONDUIT_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("CONDUIT_SEND_QUEUE", 1, 1_000_000) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = env.u64("CONDUIT_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = env.u64("CONDUIT_MAX_MISSED_BEATS", 0, 100) {
        settings.heartbeat.max_missed_beats = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("CONDUIT_STAGE_TIMEOUT_MS", 100, 3_600_000) {
        settings.orchestration.stage_timeout_ms = v;
    }
    if let Some(v) = env.u64("CONDUIT_IDLE_THRESHOLD_MS", 1000, 86_400_000) {
        settings.lifecycle.idle_threshold_ms = v;
    }
    if let Some(v) = env.u64("CONDUIT_ORPHAN_TIMEOUT_MS", 1000, 86_400_000) {
        settings.lifecycle.orphan_timeout_ms = v;
    }
    if let Some(v) = env.usize("CONDUIT_MEMORY_CAP_BYTES", 1024, usize::MAX) {
        settings.lifecycle.memory_cap_bytes = v;
    }
    if let Some(v) = env.string("CONDUIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CONDUIT_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.bool("CONDUIT_METRICS") {
        settings.logging.metrics_enabled = v;
    }
}

// ── Pure parsers ────────────────────────────────────────────────────────────

/// Parse `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u16` within `min..=max`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, key: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let raw = self.string(key)?;
        let parsed = parse(&raw);
        if parsed.is_none() {
            warn!(key, value = %raw, kind, "invalid settings override, ignoring");
        }
        parsed
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.parsed(key, "bool", parse_bool)
    }

    fn u16(&self, key: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(key, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, key: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(key, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, key: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(key, "usize", |v| parse_usize_range(v, min, max))
    }
}
