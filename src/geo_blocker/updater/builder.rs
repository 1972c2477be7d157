use std::{
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{
    super::{
        Error, Result,
        dataset::Acquirer,
        filter::PacketFilter,
        option::{DatasetOption, FwOption, NetworkOption, SnapshotOption, UpdateOption},
        snapshot::SnapshotManager,
        source::ConfigSource,
    },
    Inner, Updater,
};

#[derive(Default)]
pub struct UpdaterBuilder {
    dataset: DatasetOption,
    network: NetworkOption,
    firewall: FwOption,
    snapshot: SnapshotOption,
    update: UpdateOption,
    filter: Option<Arc<dyn PacketFilter>>,
    source: Option<Arc<dyn ConfigSource>>,
}

impl UpdaterBuilder {
    pub fn dataset(mut self, option: &DatasetOption) -> Self {
        self.dataset = option.clone();
        self
    }
    pub fn network(mut self, option: &NetworkOption) -> Self {
        self.network = option.clone();
        self
    }
    pub fn firewall(mut self, option: &FwOption) -> Self {
        self.firewall = option.clone();
        self
    }
    pub fn snapshot(mut self, option: &SnapshotOption) -> Self {
        self.snapshot = option.clone();
        self
    }
    pub fn update(mut self, option: &UpdateOption) -> Self {
        self.update = option.clone();
        self
    }
    pub fn filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
    pub fn source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }
    pub fn build(self) -> Result<Updater> {
        let filter = self
            .filter
            .ok_or_else(|| Error::Config("Updater requires a packet filter".to_string()))?;
        let source = self
            .source
            .ok_or_else(|| Error::Config("Updater requires a configuration source".to_string()))?;

        Ok(Updater {
            inner: Arc::new(Inner {
                acquirer: Acquirer::new(&self.dataset, &self.network)?,
                filter,
                source,
                snapshots: SnapshotManager::new(&self.snapshot),
                firewall: self.firewall,
                poll_interval: Duration::from_millis(self.update.poll_interval),
                lock: Arc::default(),
                lock_path: self.update.lock,
                runs: DashMap::new(),
                next_handle: AtomicU64::new(0),
            }),
        })
    }
}
