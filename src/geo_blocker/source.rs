use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, FixedOffset, Local};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};

use super::{Error, Result};

/// Two letter country code as found in the dataset, always upper case
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl FromStr for CountryCode {
    type Err = String;

    /// Accepts two ASCII letters, or the dataset's "-" placeholder for
    /// unassigned ranges
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "-" || (s.len() == 2 && s.bytes().all(|b| b.is_ascii_alphabetic())) {
            Ok(CountryCode(s.to_ascii_uppercase()))
        } else {
            Err(format!("Invalid country code: {}", s))
        }
    }
}

impl Display for CountryCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result { f.write_str(&self.0) }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.parse::<CountryCode>() {
            Ok(code) if code.0 != "-" => Ok(code),
            _ => Err(serde::de::Error::custom(format!("Invalid country code: {}", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// A port that stays reachable from blocked countries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct PortRule {
    pub port: u16,
    pub protocol: Protocol,
}

impl Display for PortRule {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result { write!(f, "{}/{}", self.port, self.protocol) }
}

/// Read/write contract of the store owning the operator's selection
///
/// Implementations are read on every run so that edits made between runs
/// are picked up without restarting.
pub trait ConfigSource: Send + Sync {
    fn selected_countries(&self) -> Result<BTreeSet<CountryCode>>;

    /// Whitelisted CIDRs, in the order the operator entered them
    fn whitelist(&self) -> Result<Vec<String>>;

    fn port_rules(&self) -> Result<Vec<PortRule>>;

    /// Countries, whitelist and ports taken from one version of the store
    fn selection(&self) -> Result<Selection> {
        Ok(Selection {
            countries: self.selected_countries()?,
            whitelist: self.whitelist()?,
            ports: self.port_rules()?,
        })
    }

    fn record_completion(&self, timestamp: DateTime<Local>) -> Result<()>;

    fn last_completion(&self) -> Result<Option<DateTime<FixedOffset>>>;
}

/// Operator selection as stored in the selection file
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub countries: BTreeSet<CountryCode>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortRule>,
}

/// Run bookkeeping stored in the state file
#[derive(Debug, Default, Deserialize, Serialize)]
struct State {
    #[serde(default)]
    last_completion: Option<String>,
}

/// Configuration source backed by two TOML files
///
/// The selection file is owned by whoever edits the selection (usually the
/// web UI). The state file is written by the updater only.
pub struct FileSource {
    selection: PathBuf,
    state: PathBuf,
}

impl FileSource {
    pub fn new(selection: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
        FileSource {
            selection: selection.into(),
            state: state.into(),
        }
    }

    fn load_selection(&self) -> Result<Selection> {
        match fs::read_to_string(&self.selection) {
            Ok(data) => Ok(toml::from_str(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "SELECTION FILE [{}] NOT FOUND, NOTHING SELECTED",
                    self.selection.display()
                );
                Ok(Selection::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_state(&self) -> Result<State> {
        match fs::read_to_string(&self.state) {
            Ok(data) => Ok(toml::from_str(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(State::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ConfigSource for FileSource {
    fn selected_countries(&self) -> Result<BTreeSet<CountryCode>> {
        Ok(self.load_selection()?.countries)
    }

    fn whitelist(&self) -> Result<Vec<String>> { Ok(self.load_selection()?.whitelist) }

    fn port_rules(&self) -> Result<Vec<PortRule>> { Ok(self.load_selection()?.ports) }

    /// Single read of the selection file
    fn selection(&self) -> Result<Selection> { self.load_selection() }

    fn record_completion(&self, timestamp: DateTime<Local>) -> Result<()> {
        let state = State {
            last_completion: Some(timestamp.to_rfc3339()),
        };
        let data = toml::to_string(&state).map_err(|e| Error::Config(e.to_string()))?;
        write_atomic(&self.state, data.as_bytes())?;
        debug!("RECORD COMPLETION [{}]", timestamp.to_rfc3339());
        Ok(())
    }

    fn last_completion(&self) -> Result<Option<DateTime<FixedOffset>>> {
        match self.load_state()?.last_completion {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(Some)
                .map_err(|e| Error::Config(format!("Invalid completion timestamp {}: {}", s, e))),
            None => Ok(None),
        }
    }
}

/// Writes `data` to a sibling temp file then renames it over `path`
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// In-process source used by tests
#[cfg(test)]
pub mod memory {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemorySource {
        pub countries: Mutex<BTreeSet<CountryCode>>,
        pub whitelist: Mutex<Vec<String>>,
        pub ports: Mutex<Vec<PortRule>>,
        pub completion: Mutex<Option<DateTime<Local>>>,
        /// Number of whole-selection reads
        pub selections: AtomicUsize,
    }

    impl MemorySource {
        pub fn select(&self, codes: &[&str]) {
            *self.countries.lock() = codes.iter().map(|c| c.parse().unwrap()).collect();
        }
    }

    impl ConfigSource for MemorySource {
        fn selected_countries(&self) -> Result<BTreeSet<CountryCode>> {
            Ok(self.countries.lock().clone())
        }

        fn whitelist(&self) -> Result<Vec<String>> { Ok(self.whitelist.lock().clone()) }

        fn port_rules(&self) -> Result<Vec<PortRule>> { Ok(self.ports.lock().clone()) }

        fn selection(&self) -> Result<Selection> {
            self.selections.fetch_add(1, Ordering::SeqCst);
            Ok(Selection {
                countries: self.countries.lock().clone(),
                whitelist: self.whitelist.lock().clone(),
                ports: self.ports.lock().clone(),
            })
        }

        fn record_completion(&self, timestamp: DateTime<Local>) -> Result<()> {
            *self.completion.lock() = Some(timestamp);
            Ok(())
        }

        fn last_completion(&self) -> Result<Option<DateTime<FixedOffset>>> {
            Ok(self.completion.lock().map(|t| t.fixed_offset()))
        }
    }
}
