//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleSettings::default()`]
//! 2. If `~/.huddle/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `HUDDLE_*` environment variable overrides (highest priority)
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
use crate::types::HuddleSettings;

/// The huddle home directory (`~/.huddle`).
pub fn huddle_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".huddle")
}

/// Resolve the path to the settings file (`~/.huddle/settings.json`).
pub fn settings_path() -> PathBuf {
    huddle_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<HuddleSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HuddleSettings> {
    let defaults = serde_json::to_value(HuddleSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HuddleSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
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

/// Apply `HUDDLE_*` environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut HuddleSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup` (a stand-in for the environment).
pub fn apply_overrides<F>(settings: &mut HuddleSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("HUDDLE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("HUDDLE_PORT", |s| parse_u16_range(s, 0, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("HUDDLE_CHANNEL_BUFFER", |s| {
        parse_usize_range(s, 1, 1_000_000)
    }) {
        settings.server.channel_buffer = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("HUDDLE_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = env.parsed("HUDDLE_POOL_SIZE", |s| parse_u32_range(s, 1, 256)) {
        settings.store.pool_size = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.parsed("HUDDLE_LOG_LEVEL", parse_level) {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("HUDDLE_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a log level name, normalized to lowercase.
pub fn parse_level(val: &str) -> Option<String> {
    let level = val.to_lowercase();
    crate::types::LOG_LEVELS
        .contains(&level.as_str())
        .then_some(level)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 9100, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.store.db_path, "huddle.db");
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"channelBuffer": 16}, "logging": {"modules": {"huddle_dispatch": "debug"}}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.channel_buffer, 16);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.logging.modules["huddle_dispatch"], "debug");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"store": {"poolSize": 0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut settings = HuddleSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("HUDDLE_HOST", "0.0.0.0"),
                ("HUDDLE_PORT", "8088"),
                ("HUDDLE_CHANNEL_BUFFER", "32"),
                ("HUDDLE_DB_PATH", ":memory:"),
                ("HUDDLE_POOL_SIZE", "4"),
                ("HUDDLE_LOG_LEVEL", "DEBUG"),
                ("HUDDLE_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.server.channel_buffer, 32);
        assert!(settings.store.is_in_memory());
        assert_eq!(settings.store.pool_size, 4);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_overrides_ignored() {
        let mut settings = HuddleSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("HUDDLE_PORT", "99999"),
                ("HUDDLE_POOL_SIZE", "0"),
                ("HUDDLE_LOG_LEVEL", "chatty"),
                ("HUDDLE_HOST", ""),
            ]),
        );
        let defaults = HuddleSettings::default();
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.store.pool_size, defaults.store.pool_size);
        assert_eq!(settings.logging.level, defaults.logging.level);
        assert_eq!(settings.server.host, defaults.server.host);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "on", "TRUE"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "off", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("0", 0, 65535), Some(0));
        assert_eq!(parse_u16_range("70000", 0, 65535), None);
        assert_eq!(parse_u32_range("257", 1, 256), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
    }

    #[test]
    fn parse_level_normalizes() {
        assert_eq!(parse_level("WARN").as_deref(), Some("warn"));
        assert_eq!(parse_level("verbose"), None);
    }
}
