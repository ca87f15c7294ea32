//! Configuration structures for port-relay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Control API configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Relay tuning.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Rule store location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Boot-time behaviour.
    #[serde(default)]
    pub startup: StartupConfig,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Control API binding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional).
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Relay tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Target connect timeout in seconds. Zero leaves it to the OS.
    #[serde(default)]
    pub connect_timeout: u64,

    /// Seconds a UDP client association survives without a reply.
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,

    /// Copy buffer size per TCP direction.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Closed connections kept in history.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl LimitsConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout > 0).then(|| Duration::from_secs(self.connect_timeout))
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout.max(1))
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 0,
            udp_idle_timeout: default_udp_idle_timeout(),
            buffer_size: default_buffer_size(),
            max_history: default_max_history(),
        }
    }
}

fn default_udp_idle_timeout() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    8192
}

fn default_max_history() -> usize {
    1000
}

/// Rule store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding rules and templates.
    #[serde(default = "default_data_file")]
    pub data_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
        }
    }
}

fn default_data_file() -> String {
    "db/data.json".to_string()
}

/// Startup configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Template whose rules are started at boot.
    pub autostart_template: Option<String>,
}
