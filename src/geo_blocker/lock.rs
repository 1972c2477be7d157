use std::{
    fs::{self, File, OpenOptions},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use fs2::FileExt;
use log::debug;

use super::{Error, Result};

/// Exclusive advisory lock on the run lock file, shared by every geoblock
/// process on the host
///
/// The lock is released when the guard is dropped.
pub struct RunLock {
    _file: File,
}

impl RunLock {
    /// Take the lock without waiting, [`Error::AlreadyRunning`] if another holder exists
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // No truncation, the holder may be another process
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        file.try_lock_exclusive().map_err(|e| {
            debug!("LOCK [{}] HELD: {}", path.display(), e);
            Error::AlreadyRunning
        })?;
        debug!("LOCK [{}] ACQUIRED", path.display());

        Ok(RunLock { _file: file })
    }
}
