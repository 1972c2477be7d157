use std::fmt::{self, Display, Formatter};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Outbound connectivity could not be established, or the download failed
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Archive or data file unreadable, or too many malformed records
    #[error("Dataset format error: {0}")]
    DatasetFormat(String),

    /// A privileged call against the packet filter failed
    #[error("Privileged call failed: {0}")]
    Privilege(String),

    /// One insertion of a sequence failed, earlier ones are left applied
    #[error("Partial apply at [{step}]: {detail}")]
    PartialApply { step: String, detail: String },

    #[error("An update is already running")]
    AlreadyRunning,

    /// A step of the run panicked
    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NetworkUnavailable(_) => FailureKind::NetworkUnavailable,
            Error::DatasetFormat(_) => FailureKind::DatasetFormat,
            Error::Privilege(_) => FailureKind::Privilege,
            Error::PartialApply { .. } => FailureKind::PartialApply,
            Error::AlreadyRunning => FailureKind::AlreadyRunning,
            Error::Aborted(_) => FailureKind::Aborted,
            Error::Config(_) | Error::Toml(_) => FailureKind::Config,
            Error::Io(_) => FailureKind::Io,
        }
    }
}

/// Failure category reported through run status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    NetworkUnavailable,
    DatasetFormat,
    Privilege,
    PartialApply,
    AlreadyRunning,
    Aborted,
    Config,
    Io,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            FailureKind::NetworkUnavailable => "NETWORK UNAVAILABLE",
            FailureKind::DatasetFormat => "DATASET FORMAT",
            FailureKind::Privilege => "PRIVILEGE",
            FailureKind::PartialApply => "PARTIAL APPLY",
            FailureKind::AlreadyRunning => "ALREADY RUNNING",
            FailureKind::Aborted => "ABORTED",
            FailureKind::Config => "CONFIG",
            FailureKind::Io => "IO",
        };
        f.write_str(s)
    }
}
