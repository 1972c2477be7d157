use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// Where the geolocation dataset comes from and how strictly it is parsed
#[derive(Clone, Debug, Deserialize)]
pub struct DatasetOption {
    /// URL of the compressed dataset (ZIP or gzip)
    #[serde(default = "DatasetOption::default_url")]
    pub url: String,

    /// Read the archive from this local file instead of downloading it
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Keep a copy of the downloaded archive at this path
    #[serde(default)]
    pub keep_archive: Option<PathBuf>,

    /// Download timeout in seconds
    #[serde(default = "DatasetOption::default_timeout")]
    pub timeout: u64,

    /// Maximum accepted archive size in bytes
    #[serde(default = "DatasetOption::default_max_size")]
    pub max_size: u64,

    /// Share of malformed records tolerated before the dataset is rejected
    #[serde(default = "DatasetOption::default_max_malformed_ratio")]
    pub max_malformed_ratio: f64,
}

impl DatasetOption {
    #[inline]
    fn default_url() -> String {
        "https://download.ip2location.com/lite/IP2LOCATION-LITE-DB1.CSV.ZIP".to_string()
    }

    #[inline]
    fn default_timeout() -> u64 { 120 }

    #[inline]
    fn default_max_size() -> u64 { 64 * 1024 * 1024 }

    #[inline]
    fn default_max_malformed_ratio() -> f64 { 0.01 }
}

impl Default for DatasetOption {
    fn default() -> Self {
        Self {
            url: DatasetOption::default_url(),
            path: None,
            keep_archive: None,
            timeout: DatasetOption::default_timeout(),
            max_size: DatasetOption::default_max_size(),
            max_malformed_ratio: DatasetOption::default_max_malformed_ratio(),
        }
    }
}

/// Connectivity precondition checked before each run
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkOption {
    /// Address probed with a TCP connect, e.g. "8.8.8.8:53"
    /// The check is skipped when set to an empty string
    #[serde(default = "NetworkOption::default_probe")]
    pub probe: Option<String>,

    /// Timeout of a single connect attempt in milliseconds
    #[serde(default = "NetworkOption::default_connect_timeout")]
    pub connect_timeout: u64,

    /// Number of retries after the first failed attempt
    #[serde(default = "NetworkOption::default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds, doubled on each retry
    #[serde(default = "NetworkOption::default_backoff")]
    pub backoff: u64,

    /// Upper bound of the retry delay in milliseconds
    #[serde(default = "NetworkOption::default_max_backoff")]
    pub max_backoff: u64,
}

impl NetworkOption {
    #[inline]
    fn default_probe() -> Option<String> { Some("8.8.8.8:53".to_string()) }

    #[inline]
    fn default_connect_timeout() -> u64 { 3000 }

    #[inline]
    fn default_max_retries() -> u32 { 6 }

    #[inline]
    fn default_backoff() -> u64 { 5000 }

    #[inline]
    fn default_max_backoff() -> u64 { 60_000 }

    /// Probe address, `None` when the check is disabled
    pub fn probe(&self) -> Option<&str> { self.probe.as_deref().filter(|p| !p.trim().is_empty()) }

    /// Delay before retry number `attempt` (starting at 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

impl Default for NetworkOption {
    fn default() -> Self {
        Self {
            probe: NetworkOption::default_probe(),
            connect_timeout: NetworkOption::default_connect_timeout(),
            max_retries: NetworkOption::default_max_retries(),
            backoff: NetworkOption::default_backoff(),
            max_backoff: NetworkOption::default_max_backoff(),
        }
    }
}

/// Options for the kernel set and the iptables chain holding the rules
#[derive(Clone, Debug, Deserialize)]
pub struct FwOption {
    /// IP set name for the blocked networks
    #[serde(default = "FwOption::default_set_name")]
    pub set_name: String,

    /// iptables table holding the rules
    #[serde(default = "FwOption::default_table")]
    pub table: String,

    /// Ingress chain holding the rules
    #[serde(default = "FwOption::default_chain")]
    pub chain: String,

    /// Maximum number of elements of the set, kernel default is 65536
    #[serde(default = "FwOption::default_max_elem")]
    pub max_elem: u32,
}

impl FwOption {
    #[inline]
    fn default_set_name() -> String { "GEO_BLOCK".to_string() }

    #[inline]
    fn default_table() -> String { "filter".to_string() }

    #[inline]
    fn default_chain() -> String { "INPUT".to_string() }

    #[inline]
    fn default_max_elem() -> u32 { 1 << 20 }
}

impl Default for FwOption {
    fn default() -> Self {
        FwOption {
            set_name: FwOption::default_set_name(),
            table: FwOption::default_table(),
            chain: FwOption::default_chain(),
            max_elem: FwOption::default_max_elem(),
        }
    }
}

/// Where pre-mutation snapshots are written and how many are kept
#[derive(Clone, Debug, Deserialize)]
pub struct SnapshotOption {
    #[serde(default = "SnapshotOption::default_dir")]
    pub dir: PathBuf,

    /// Number of snapshot pairs kept, 0 keeps all of them
    #[serde(default = "SnapshotOption::default_retain")]
    pub retain: usize,
}

impl SnapshotOption {
    #[inline]
    fn default_dir() -> PathBuf { PathBuf::from("/opt/iptables/backup") }

    #[inline]
    fn default_retain() -> usize { 30 }
}

impl Default for SnapshotOption {
    fn default() -> Self {
        Self {
            dir: SnapshotOption::default_dir(),
            retain: SnapshotOption::default_retain(),
        }
    }
}

/// Run scheduling options
#[derive(Clone, Debug, Deserialize)]
pub struct UpdateOption {
    /// Status polling interval in milliseconds while waiting for a run
    #[serde(default = "UpdateOption::default_poll_interval")]
    pub poll_interval: u64,

    /// Interval between runs in daemon mode, in seconds
    #[serde(default = "UpdateOption::default_interval")]
    pub interval: u64,

    /// Lock file held for the duration of a run, shared by all geoblock processes
    #[serde(default = "UpdateOption::default_lock")]
    pub lock: PathBuf,
}

impl UpdateOption {
    #[inline]
    fn default_poll_interval() -> u64 { 500 }

    #[inline]
    fn default_interval() -> u64 { 14 * 24 * 3600 }

    #[inline]
    fn default_lock() -> PathBuf { PathBuf::from("/run/geoblock.lock") }
}

impl Default for UpdateOption {
    fn default() -> Self {
        Self {
            poll_interval: UpdateOption::default_poll_interval(),
            interval: UpdateOption::default_interval(),
            lock: UpdateOption::default_lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let option = NetworkOption {
            backoff: 100,
            max_backoff: 1000,
            ..NetworkOption::default()
        };
        assert_eq!(option.delay(1), Duration::from_millis(100));
        assert_eq!(option.delay(2), Duration::from_millis(200));
        assert_eq!(option.delay(4), Duration::from_millis(800));
        assert_eq!(option.delay(5), Duration::from_millis(1000));
        assert_eq!(option.delay(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let option: FwOption = toml::from_str("").unwrap();
        assert_eq!(option.set_name, "GEO_BLOCK");
        assert_eq!(option.chain, "INPUT");

        let option: NetworkOption = toml::from_str("max_retries = 2").unwrap();
        assert_eq!(option.max_retries, 2);
        assert_eq!(option.probe.as_deref(), Some("8.8.8.8:53"));
    }
}
