//! Configuration management for the secure chat core.
//!
//! TOML-based configuration with three sources merged in order: built-in
//! defaults, a configuration file, and `SECURE_CHAT_*` environment variables.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "secure-chat.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "SECURE_CHAT";

/// Complete configuration for the chat core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Transport configuration
    pub transport: TransportConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay endpoint the single logical connection is opened against
    pub endpoint: String,
    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_size: usize,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Prefix log lines with a timestamp
    pub timestamps: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: crate::defaults::DEFAULT_ENDPOINT.to_string(),
            connect_timeout_secs: crate::defaults::DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: crate::MAX_FRAME_SIZE,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl TransportConfig {
    /// Connection establishment timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ReconnectConfig {
    /// Delay before the first retry
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Upper bound on the retry delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// Without an explicit file, `./secure-chat.toml` and then the platform
    /// configuration directory are tried.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("secure-chat-core")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = Self::from_file(location)?;
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Apply `SECURE_CHAT_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(endpoint) = std::env::var(format!("{ENV_PREFIX}_TRANSPORT_ENDPOINT")) {
            self.transport.endpoint = endpoint;
        }

        if let Ok(timeout) = std::env::var(format!("{ENV_PREFIX}_TRANSPORT_CONNECT_TIMEOUT_SECS")) {
            self.transport.connect_timeout_secs =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    field: format!("{ENV_PREFIX}_TRANSPORT_CONNECT_TIMEOUT_SECS"),
                    value: timeout,
                })?;
        }

        if let Ok(max_delay) = std::env::var(format!("{ENV_PREFIX}_RECONNECT_MAX_DELAY_MS")) {
            self.reconnect.max_delay_ms =
                max_delay.parse().map_err(|_| ConfigError::InvalidValue {
                    field: format!("{ENV_PREFIX}_RECONNECT_MAX_DELAY_MS"),
                    value: max_delay,
                })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if !(self.transport.endpoint.starts_with("ws://")
            || self.transport.endpoint.starts_with("wss://")
            || self.transport.endpoint.starts_with("memory://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "transport.endpoint".to_string(),
                value: self.transport.endpoint.clone(),
            }
            .into());
        }

        if self.transport.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transport.max_frame_size".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        if self.reconnect.base_delay_ms == 0 || self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.base_delay_ms".to_string(),
                value: self.reconnect.base_delay_ms.to_string(),
            }
            .into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "logging.level".to_string(),
                    value: self.logging.level.clone(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
