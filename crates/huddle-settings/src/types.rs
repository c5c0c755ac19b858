//! Settings types.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial user
//! file only has to name the values it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::loader::huddle_dir;

/// Log levels accepted by `logging.level` and module overrides.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Root settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HuddleSettings {
    /// Network transport.
    pub server: ServerSettings,
    /// Persistence.
    pub store: StoreSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl HuddleSettings {
    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.channel_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.channelBuffer must be at least 1".into(),
            ));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxFrameBytes must be at least 1".into(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "store.poolSize must be at least 1".into(),
            ));
        }
        check_level("logging.level", &self.logging.level)?;
        for (module, level) in &self.logging.modules {
            check_level(&format!("logging.modules.{module}"), level)?;
        }
        Ok(())
    }
}

fn check_level(key: &str, level: &str) -> Result<()> {
    if LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(SettingsError::InvalidValue(format!(
            "{key}: unknown log level {level:?}"
        )))
    }
}

/// WebSocket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub channel_buffer: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9100,
            channel_buffer: 256,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Database settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Database file, relative to `~/.huddle` unless absolute.
    /// `":memory:"` keeps everything in memory.
    pub db_path: String,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl StoreSettings {
    /// Marker value for an in-memory database.
    pub const IN_MEMORY: &'static str = ":memory:";

    /// Whether the database lives in memory.
    pub fn is_in_memory(&self) -> bool {
        self.db_path == Self::IN_MEMORY
    }

    /// Absolute database path.
    pub fn resolved_db_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.db_path);
        if path.is_absolute() {
            path
        } else {
            huddle_dir().join(path)
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "huddle.db".to_string(),
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides (e.g. `"huddle_dispatch": "debug"`).
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
