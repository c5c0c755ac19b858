//! # huddle-telemetry
//!
//! Installs the process-wide `tracing` subscriber: an [`EnvFilter`] built
//! from a default level plus per-module overrides, feeding a fmt layer that
//! writes JSON lines or human-readable output to stdout.

#![deny(unsafe_code)]

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG` env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `"huddle_dispatch"` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of pretty output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from level names. Unknown names fall back to the defaults
    /// (INFO for the base level, dropped for module overrides).
    pub fn from_names<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: modules
                .into_iter()
                .filter_map(|(module, level)| {
                    level.parse().ok().map(|level| (module.to_string(), level))
                })
                .collect(),
            json,
        }
    }

    /// Filter directives, e.g. `"info,huddle_dispatch=debug"`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed (by an embedding
/// application or an earlier call); the existing one is left in place.
pub fn init_telemetry(config: &TelemetryConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let pretty_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("huddle_dispatch".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directives(), "warn,huddle_dispatch=debug");
    }

    #[test]
    fn from_names_skips_unknown_levels() {
        let config = TelemetryConfig::from_names(
            "debug",
            [("huddle_store", "trace"), ("huddle_admin", "loud")],
            false,
        );
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.module_levels, vec![("huddle_store".to_string(), Level::TRACE)]);
        assert_eq!(
            TelemetryConfig::from_names("bogus", std::iter::empty(), false).log_level,
            Level::INFO
        );
    }

    #[test]
    fn second_init_is_rejected_quietly() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(!init_telemetry(&config));
    }
}
