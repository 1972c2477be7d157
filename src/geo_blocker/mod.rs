mod blockset;
mod cidr;
mod dataset;
mod error;
mod filter;
mod firewall;
mod lock;
mod option;
mod snapshot;
mod source;
mod updater;

pub use error::{Error, FailureKind};
pub use filter::{KernelFilter, MemoryFilter, PacketFilter};
pub use firewall::Rule;
pub use option::{DatasetOption, FwOption, NetworkOption, SnapshotOption, UpdateOption};
pub use source::{ConfigSource, FileSource};
pub use updater::{RunStatus, Updater};

pub type Result<T> = std::result::Result<T, Error>;
