//! Layered configuration loading.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. `/etc/dlq-keeper/config.{yaml,json}`, system-wide defaults
//! 2. `./config/dlq-keeper.{yaml,json}`, deployment-local overrides
//! 3. an explicit file given on the command line or in `DLQ_KEEPER_CONFIG`
//! 4. environment variables prefixed `DLQK__`, e.g.
//!    `DLQK__MONITOR__PEEK_BATCH_SIZE=50` sets `monitor.peek_batch_size`
//!
//! Every section carries serde defaults, so an unconfigured environment
//! yields a valid configuration. A malformed file or a value that cannot be
//! coerced to its field type is an error.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::executor::ExecutorConfig;
use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "DLQ_KEEPER_CONFIG";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "DLQK";

const SYSTEM_CONFIG: &str = "/etc/dlq-keeper/config";
const LOCAL_CONFIG: &str = "config/dlq-keeper";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqKeeperConfig {
    pub monitor: MonitorConfig,
    pub executor: ExecutorConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {message}")]
    Load { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl DlqKeeperConfig {
    /// Load from the standard sources and the process environment
    ///
    /// `explicit` takes precedence over `DLQ_KEEPER_CONFIG`. An explicit
    /// file must exist; the standard locations are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty());
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| from_env.map(Into::into));

        Self::load_with_env(explicit.as_deref(), None)
    }

    /// Load with the environment layer taken from `env` instead of the process
    ///
    /// `None` reads the process environment. Only the standard locations,
    /// `explicit` and the `DLQK__` layer are consulted.
    pub fn load_with_env(
        explicit: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::with_name(SYSTEM_CONFIG).required(false))
            .add_source(::config::File::with_name(LOCAL_CONFIG).required(false));

        if let Some(path) = explicit {
            tracing::info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("orchestrator.namespaces")
            .source(env);

        let config: Self = builder
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load a single YAML or JSON file, without other sources
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Load {
                message: format!("file not found: {}", path.display()),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config: Self = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Load {
                message: format!("invalid YAML: {}", e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ConfigError::Load {
                message: format!("invalid JSON: {}", e),
            })?,
            _ => serde_json::from_str(&contents)
                .or_else(|_| serde_yaml::from_str(&contents))
                .map_err(|e| ConfigError::Load {
                    message: format!("failed to parse as JSON or YAML: {}", e),
                })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.peek_batch_size == 0 {
            return Err(ConfigError::invalid("monitor.peek_batch_size", "must be at least 1"));
        }
        if self.monitor.peek_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "monitor.peek_timeout_seconds",
                "must be at least 1",
            ));
        }
        if self.monitor.max_delivery_count_hint == 0 {
            return Err(ConfigError::invalid(
                "monitor.max_delivery_count_hint",
                "must be at least 1",
            ));
        }

        if self.executor.broker_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "executor.broker_timeout_seconds",
                "must be at least 1",
            ));
        }
        if self.executor.retry_base_delay_ms > self.executor.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "executor.retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }

        if self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::invalid("rate_limit.window_seconds", "must be at least 1"));
        }
        if self.rate_limit.max_tracked_rules == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.max_tracked_rules",
                "must be at least 1",
            ));
        }

        self.circuit_breaker
            .validate()
            .map_err(|e| ConfigError::invalid("circuit_breaker", e.to_string()))?;

        if self.orchestrator.scan_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.scan_interval_seconds",
                "must be at least 1",
            ));
        }
        if self.orchestrator.max_concurrent_namespaces == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.max_concurrent_namespaces",
                "must be at least 1",
            ));
        }
        if self.orchestrator.max_concurrent_replays == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.max_concurrent_replays",
                "must be at least 1",
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
