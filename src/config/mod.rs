//! Configuration management for netpaste
//!
//! This module handles loading, validating, and managing the optional TOML
//! configuration file. Every setting has a default, so a missing file is
//! not an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::KdfParams;
use crate::sync::SyncConfig;
use crate::transport::{ReconnectionConfig, TransportConfig, MAX_FRAGMENT_LEN};

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "NETPASTE_CONFIG";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Port used when none is given on the command line
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Clipboard polling
    #[serde(default)]
    pub sync: SyncSettings,

    /// Framing and connection limits
    #[serde(default)]
    pub transport: TransportSettings,

    /// Reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Key derivation cost
    #[serde(default)]
    pub security: SecuritySettings,
}

/// Clipboard polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Polling period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Largest fragment body sent
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: usize,

    /// Largest reassembled message accepted; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,

    /// Size of a single stream read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect; 0 reconnects immediately
    #[serde(default)]
    pub initial_delay_ms: u64,

    /// Upper bound on the backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff growth per failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Consecutive failed attempts before giving up; 0 retries forever
    #[serde(default)]
    pub max_attempts: u32,
}

/// Security configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Argon2id memory cost in KiB
    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,

    /// Argon2id passes
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Argon2id lanes
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_fragment_size() -> usize {
    crate::transport::DEFAULT_MAX_FRAGMENT_SIZE
}

fn default_read_buffer_size() -> usize {
    8 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_kdf_memory_kib() -> u32 {
    KdfParams::default().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::default().iterations
}

fn default_kdf_parallelism() -> u32 {
    KdfParams::default().parallelism
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_fragment_size: default_max_fragment_size(),
            max_message_size: None,
            read_buffer_size: default_read_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            max_attempts: 0,
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            log_level: default_log_level(),
            sync: SyncSettings::default(),
            transport: TransportSettings::default(),
            reconnect: ReconnectSettings::default(),
            security: SecuritySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from NETPASTE_CONFIG environment variable
    /// 2. `<config dir>/netpaste/config.toml`
    /// 3. Built-in defaults if neither exists
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path when given, otherwise from default locations.
    ///
    /// An explicit path must exist.
    pub fn load_config(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(&path),
            None => Self::load(),
        }
    }

    /// Find configuration file path
    pub fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|p| p.exists())
    }

    /// Platform default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("netpaste").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "log_level must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        if !(50..=60_000).contains(&self.sync.poll_interval_ms) {
            return Err(ConfigError::Validation(
                "sync.poll_interval_ms must be between 50 and 60000".to_string(),
            ));
        }

        let transport = &self.transport;
        if transport.max_fragment_size == 0 || transport.max_fragment_size > MAX_FRAGMENT_LEN {
            return Err(ConfigError::Validation(format!(
                "transport.max_fragment_size must be between 1 and {}",
                MAX_FRAGMENT_LEN
            )));
        }
        if transport.max_message_size == Some(0) {
            return Err(ConfigError::Validation(
                "transport.max_message_size must be at least 1".to_string(),
            ));
        }
        if transport.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "transport.read_buffer_size must be at least 1".to_string(),
            ));
        }
        if transport.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "transport.connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter_factor) {
            return Err(ConfigError::Validation(
                "reconnect.jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "reconnect.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::Validation(
                "reconnect.max_delay_ms must not be below reconnect.initial_delay_ms".to_string(),
            ));
        }

        let security = &self.security;
        if security.kdf_iterations == 0 || security.kdf_parallelism == 0 {
            return Err(ConfigError::Validation(
                "security.kdf_iterations and security.kdf_parallelism must be at least 1".to_string(),
            ));
        }
        if security.kdf_memory_kib < 8 * security.kdf_parallelism {
            return Err(ConfigError::Validation(
                "security.kdf_memory_kib must be at least 8 times security.kdf_parallelism".to_string(),
            ));
        }

        Ok(())
    }

    /// Write configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clipboard polling period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.poll_interval_ms)
    }

    /// Sync loop settings; `monitor` comes from the command line
    pub fn sync_config(&self, monitor: bool) -> SyncConfig {
        SyncConfig {
            poll_interval: self.poll_interval(),
            monitor,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_fragment_size: self.transport.max_fragment_size,
            max_message_size: self.transport.max_message_size,
            read_buffer_size: self.transport.read_buffer_size,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
        }
    }

    pub fn reconnection_config(&self) -> ReconnectionConfig {
        ReconnectionConfig {
            max_attempts: self.reconnect.max_attempts,
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            backoff_multiplier: self.reconnect.backoff_multiplier,
            jitter_factor: self.reconnect.jitter_factor,
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.security.kdf_memory_kib,
            iterations: self.security.kdf_iterations,
            parallelism: self.security.kdf_parallelism,
        }
    }

    /// Generate an annotated example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# netpaste configuration file
# Location: <config dir>/netpaste/config.toml, or the path in NETPASTE_CONFIG

# Port used when none is given on the command line
default_port = {}

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

[sync]
# How often the clipboard is checked for changes, in milliseconds
poll_interval_ms = {}

[transport]
# Largest fragment sent on the wire, in bytes
max_fragment_size = {}
# Largest message accepted from the peer, in bytes (unbounded when unset)
# max_message_size = 67108864
# Size of a single network read, in bytes
read_buffer_size = {}
# Seconds to wait for a connection
connect_timeout_secs = {}

[reconnect]
# Delay before reconnecting, in milliseconds (0 reconnects immediately)
initial_delay_ms = {}
# Upper bound on the reconnect delay
max_delay_ms = {}
# Delay growth per failed attempt
backoff_multiplier = {:.1}
# Random spread applied to each delay (0.0 - 1.0)
jitter_factor = {:.1}
# Failed attempts before giving up (0 retries forever)
max_attempts = {}

[security]
# Argon2id key derivation cost; must match on both peers
kdf_memory_kib = {}
kdf_iterations = {}
kdf_parallelism = {}
"#,
            config.default_port,
            config.log_level,
            config.sync.poll_interval_ms,
            config.transport.max_fragment_size,
            config.transport.read_buffer_size,
            config.transport.connect_timeout_secs,
            config.reconnect.initial_delay_ms,
            config.reconnect.max_delay_ms,
            config.reconnect.backoff_multiplier,
            config.reconnect.jitter_factor,
            config.reconnect.max_attempts,
            config.security.kdf_memory_kib,
            config.security.kdf_iterations,
            config.security.kdf_parallelism,
        )
    }
}
