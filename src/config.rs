use std::path::PathBuf;

use serde::Deserialize;

use super::geo_blocker::{
    DatasetOption, FwOption, NetworkOption, Result, SnapshotOption, UpdateOption,
};

/// Main configuration structure for the geoblock updater
///
/// Every section falls back to its defaults when absent from the TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Logger configuration
    #[serde(default)]
    pub log: LoggerConfig,

    /// Where the geolocation dataset is downloaded from
    #[serde(default)]
    pub dataset: DatasetOption,

    /// Connectivity check before each run
    #[serde(default)]
    pub network: NetworkOption,

    /// Kernel set and iptables chain
    #[serde(default)]
    pub firewall: FwOption,

    /// Pre-mutation snapshots
    #[serde(default)]
    pub snapshot: SnapshotOption,

    /// Files holding the operator's selection and the run state
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub updater: UpdateOption,
}

/// Logging configuration parameters
#[derive(Debug, Deserialize)]
pub struct LoggerConfig {
    /// Log level, determining which messages are displayed
    ///
    /// Valid values: "off", "error", "warn", "info", "debug", "trace"
    /// Default is "info".
    #[serde(default = "LoggerConfig::default_log_level")]
    pub level: String,

    /// Prefix each log message with a timestamp
    #[serde(default)]
    pub timestamp: bool,
}

impl LoggerConfig {
    #[inline]
    fn default_log_level() -> String { "info".to_string() }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LoggerConfig::default_log_level(),
            timestamp: false,
        }
    }
}

/// Paths of the file-backed configuration source
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    /// Selected countries, whitelist and port rules, edited by the operator
    #[serde(default = "SourceConfig::default_selection")]
    pub selection: PathBuf,

    /// Completion timestamp, written after each successful run
    #[serde(default = "SourceConfig::default_state")]
    pub state: PathBuf,
}

impl SourceConfig {
    #[inline]
    fn default_selection() -> PathBuf { PathBuf::from("/etc/geoblock/selection.toml") }

    #[inline]
    fn default_state() -> PathBuf { PathBuf::from("/var/lib/geoblock/state.toml") }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            selection: SourceConfig::default_selection(),
            state: SourceConfig::default_state(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(filename: &str) -> Result<Config> {
        let config_data = std::fs::read_to_string(filename)?;
        let config: Config = toml::from_str(&config_data)?;
        Ok(config)
    }
}
