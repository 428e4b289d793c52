//! Configuration structures.
//!
//! One section per monitoring back-end plus the fusion layer, loaded from a
//! single YAML file. Every field has a default so an empty file yields a
//! usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Default scheduler scrape interval (1 second).
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for any external query or command (10 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default trailing window for averaged readings (10 minutes).
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(600);

/// Default runtime monitor poll interval (5 seconds).
pub const DEFAULT_COMPSS_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum scrape interval (1 second).
pub const MIN_SCRAPE_INTERVAL: Duration = Duration::from_secs(1);

fn default_slurm_hosts() -> String {
    "ns[52-53]".to_string()
}

fn default_scrape_file() -> String {
    "slurm-host-data.log".to_string()
}

fn default_influx_url() -> String {
    "http://ns54.bullx:8086".to_string()
}

fn default_influx_database() -> String {
    "collectd".to_string()
}

fn default_zabbix_url() -> String {
    "mysql://10.10.0.1/zabbix".to_string()
}

fn default_zabbix_user() -> String {
    "zabbixinfo".to_string()
}

fn default_zabbix_password() -> String {
    "readonly".to_string()
}

fn default_zabbix_filter() -> String {
    "testnode".to_string()
}

fn default_enrichment_suffix() -> String {
    ".bullx".to_string()
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

// =============================================================================
// Batch scheduler
// =============================================================================

/// How scheduler output is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    /// Run the scrape command on an interval.
    Poll,
    /// Follow a file another process appends scrape output to.
    Tail,
}

/// Batch scheduler collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// Whether to poll the scheduler directly or tail a scrape file.
    pub mode: ScrapeMode,

    /// Host-range expression passed to the scrape command (default: "ns[52-53]").
    pub hosts: String,

    /// File followed in tail mode (default: "slurm-host-data.log").
    pub scrape_file: String,

    /// Poll interval (default: 1s, minimum: 1s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for one scrape command (default: 10s).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Trailing window retained for CPU utilisation (default: 10m).
    #[serde(with = "humantime_serde")]
    pub history_window: Duration,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            mode: ScrapeMode::Poll,
            hosts: default_slurm_hosts(),
            scrape_file: default_scrape_file(),
            interval: DEFAULT_SCRAPE_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

// =============================================================================
// Time-series store
// =============================================================================

/// Time-series store collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    /// Store endpoint (default: "http://ns54.bullx:8086").
    pub url: String,

    /// Database holding the collectd series (default: "collectd").
    pub database: String,

    /// Store user; empty for unauthenticated access.
    pub user: String,

    /// Store password; empty for unauthenticated access.
    pub password: String,

    /// Timeout for one query (default: 10s).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            database: default_influx_database(),
            user: String::new(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// =============================================================================
// Relational store
// =============================================================================

/// Relational monitoring store collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZabbixConfig {
    /// Database endpoint (default: "mysql://10.10.0.1/zabbix").
    pub url: String,

    /// Database user (default: "zabbixinfo").
    pub user: String,

    /// Database password (default: "readonly").
    pub password: String,

    /// Name prefix separating one entity class from the other
    /// (default: "testnode").
    pub filter_begins: String,

    /// Whether names matching the prefix are hosts (true) or VMs (false).
    pub filter_is_host: bool,

    /// Restrict discovery to hosts the store marks available (default: false).
    pub only_available_hosts: bool,

    /// Timeout for one query (default: 10s).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ZabbixConfig {
    fn default() -> Self {
        Self {
            url: default_zabbix_url(),
            user: default_zabbix_user(),
            password: default_zabbix_password(),
            filter_begins: default_zabbix_filter(),
            filter_is_host: true,
            only_available_hosts: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// =============================================================================
// Distributed runtime
// =============================================================================

/// Distributed runtime monitor collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompssConfig {
    /// Poll interval for the monitor document (default: 5s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for one document fetch (default: 10s).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CompssConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_COMPSS_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// =============================================================================
// Fusion
// =============================================================================

/// Fusion collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Suffix appended to an authoritative host name to form the
    /// enrichment-side candidate name (default: ".bullx").
    pub enrichment_suffix: String,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enrichment_suffix: default_enrichment_suffix(),
        }
    }
}

// =============================================================================
// Application configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Batch scheduler collector.
    pub slurm: SlurmConfig,

    /// Time-series store collector.
    pub influx: InfluxConfig,

    /// Relational store collector.
    pub zabbix: ZabbixConfig,

    /// Distributed runtime collector.
    pub compss: CompssConfig,

    /// Fusion layer.
    pub fusion: FusionConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slurm.interval < MIN_SCRAPE_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "slurm interval must be at least {:?}",
                MIN_SCRAPE_INTERVAL
            )));
        }

        if self.slurm.history_window < self.slurm.interval {
            return Err(ConfigError::ValidationError(
                "slurm history_window must be at least the scrape interval".to_string(),
            ));
        }

        if self.slurm.timeout.is_zero()
            || self.influx.timeout.is_zero()
            || self.zabbix.timeout.is_zero()
            || self.compss.timeout.is_zero()
        {
            return Err(ConfigError::ValidationError(
                "timeouts must be non-zero".to_string(),
            ));
        }

        if self.compss.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "compss interval must be non-zero".to_string(),
            ));
        }

        if self.fusion.enrichment_suffix.is_empty() {
            return Err(ConfigError::ValidationError(
                "fusion enrichment_suffix must be non-empty".to_string(),
            ));
        }

        Ok(())
    }
}
