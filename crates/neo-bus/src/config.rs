//! Application Configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `NEO_BUS_*` environment variables (nested keys separated by `__`, e.g.
//! `NEO_BUS_RPC__CIRCUIT__FAILURE_THRESHOLD=3`).

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use bus_runtime::{BusConfig, PatternManagerConfig, RpcConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NEO_BUS_";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Invalid(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeoBusConfig {
    pub log: LogConfig,
    pub bus: BusConfig,
    pub patterns: PatternManagerConfig,
    pub rpc: RpcConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "neo_bus=info,bus_runtime=info".to_string(),
            json: false,
        }
    }
}

impl NeoBusConfig {
    /// The layered provider chain
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(NeoBusConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration, failing if an explicit file does not exist
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }

        let config: NeoBusConfig = Self::figment(path).extract()?;
        tracing::debug!(?path, "Loaded configuration");
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_runtime::OptimizationMode;
    use figment::Jail;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = NeoBusConfig::default();
        assert_eq!(config.bus.default_max_retries, 2);
        assert_eq!(config.bus.max_queue_depth, 10_000);
        assert_eq!(config.rpc.circuit.failure_threshold, 5);
        assert_eq!(config.patterns.mode, OptimizationMode::Balanced);
        assert!(!config.log.json);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("neo-bus.toml");
        std::fs::write(
            &path,
            r#"
[bus]
default_max_retries = 4
reply_topic_prefix = "_r"

[patterns]
mode = "speed"
cache_ttl_ms = 250

[rpc]
jitter = true

[rpc.circuit]
failure_threshold = 2
"#,
        )
        .unwrap();

        let config = NeoBusConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bus.default_max_retries, 4);
        assert_eq!(config.bus.reply_topic_prefix, "_r");
        // Unset keys keep their defaults
        assert_eq!(config.bus.default_request_timeout_ms, 5_000);
        assert_eq!(config.patterns.mode, OptimizationMode::Speed);
        assert_eq!(config.patterns.cache_ttl_ms, Some(250));
        assert!(config.rpc.jitter);
        assert_eq!(config.rpc.circuit.failure_threshold, 2);
        assert_eq!(config.rpc.circuit.reset_timeout_ms, 30_000);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            NeoBusConfig::load(Some(&path)),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "neo-bus.toml",
                r#"
[bus]
max_queue_depth = 50

[log]
json = true
"#,
            )?;
            jail.set_env("NEO_BUS_BUS__MAX_QUEUE_DEPTH", "75");
            jail.set_env("NEO_BUS_RPC__CIRCUIT__ENABLED", "false");

            let config: NeoBusConfig =
                NeoBusConfig::figment(Some(Path::new("neo-bus.toml"))).extract()?;
            assert_eq!(config.bus.max_queue_depth, 75);
            assert!(config.log.json);
            assert!(!config.rpc.circuit.enabled);
            Ok(())
        });
    }

    #[test]
    fn test_render_round_trips() {
        let config = NeoBusConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[rpc.circuit]"));
        let parsed: NeoBusConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
