use std::{
    fs::{self, DirBuilder, OpenOptions},
    io::Write,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use log::{info, warn};

use super::{Result, filter::PacketFilter, option::SnapshotOption};

/// Sorts lexicographically in time order
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S_%3f";
const RULES_PREFIX: &str = "iptables_";
const SET_PREFIX: &str = "ipset_";
const SUFFIX: &str = ".backup";

/// Dump files written before a run mutates anything
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    pub rules: PathBuf,
    pub set: PathBuf,
}

/// Writes the current ruleset and block set to the snapshot directory
///
/// Restoring is left to the operator (`iptables-restore`, `ipset restore`).
pub struct SnapshotManager {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotManager {
    pub fn new(option: &SnapshotOption) -> Self {
        SnapshotManager {
            dir: option.dir.clone(),
            retain: option.retain,
        }
    }

    pub fn snapshot(&self, filter: &dyn PacketFilter, set_name: &str) -> Result<Snapshot> {
        DirBuilder::new().recursive(true).mode(0o700).create(&self.dir)?;

        let timestamp = Local::now();
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let rules = self.dir.join(format!("{}{}{}", RULES_PREFIX, stamp, SUFFIX));
        let set = self.dir.join(format!("{}{}{}", SET_PREFIX, stamp, SUFFIX));

        write_once(&rules, filter.dump_rules()?.as_bytes())?;
        write_once(&set, filter.dump_set(set_name)?.as_bytes())?;
        info!("SNAPSHOT [{}] [{}]", rules.display(), set.display());

        if let Err(e) = self.prune() {
            warn!("SNAPSHOT PRUNE FAILED: {}", e);
        }

        Ok(Snapshot { timestamp, rules, set })
    }

    /// Delete all but the newest `retain` snapshot pairs, returns the number of pairs deleted
    pub fn prune(&self) -> Result<usize> {
        if self.retain == 0 {
            return Ok(0);
        }

        let mut stamps: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(RULES_PREFIX))
                    .and_then(|name| name.strip_suffix(SUFFIX))
                    .map(str::to_owned)
            })
            .collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for stamp in stamps.iter().skip(self.retain) {
            for prefix in [RULES_PREFIX, SET_PREFIX] {
                let path = self.dir.join(format!("{}{}{}", prefix, stamp, SUFFIX));
                match fs::remove_file(&path) {
                    Ok(()) => (),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                    Err(e) => return Err(e.into()),
                }
            }
            info!("REMOVE SNAPSHOT [{}]", stamp);
            removed += 1;
        }
        Ok(removed)
    }
}

fn write_once(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}
