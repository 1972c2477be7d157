mod builder;

pub use builder::UpdaterBuilder;

use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Local};
use dashmap::DashMap;
use log::{error, info};
use tokio::{sync::Mutex, task, time::sleep};

use super::{
    Error, FailureKind, Result,
    blockset::BlockSetBuilder,
    dataset::Acquirer,
    filter::PacketFilter,
    firewall::{RuleEnforcer, parse_whitelist},
    lock::RunLock,
    option::FwOption,
    snapshot::SnapshotManager,
    source::ConfigSource,
};

/// Identifies one update run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunHandle(u64);

impl Display for RunHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Steps of a run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckingConnectivity,
    BackingUp,
    FetchingDataset,
    RebuildingBlockSet,
    EnforcingRules,
    RecordingCompletion,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Stage::CheckingConnectivity => "CHECKING CONNECTIVITY",
            Stage::BackingUp => "BACKING UP",
            Stage::FetchingDataset => "FETCHING DATASET",
            Stage::RebuildingBlockSet => "REBUILDING BLOCK SET",
            Stage::EnforcingRules => "ENFORCING RULES",
            Stage::RecordingCompletion => "RECORDING COMPLETION",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Stage the run was in when it failed
    pub stage: Stage,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running(Stage),
    Succeeded,
    Failed(Failure),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, RunStatus::Running(_)) }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RunStatus::Running(stage) => write!(f, "RUNNING [{}]", stage),
            RunStatus::Succeeded => f.write_str("SUCCEEDED"),
            RunStatus::Failed(failure) => write!(
                f,
                "FAILED [{}] AT [{}]: {}",
                failure.kind, failure.stage, failure.detail
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateRun {
    pub handle: RunHandle,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub status: RunStatus,
}

/// Sequences update runs against the packet filter
///
/// At most one run is in progress at a time: the run owns the lock over the
/// kernel resources until it reaches a terminal status. The in-process mutex
/// serializes triggers of this updater, the lock file serializes runs of all
/// geoblock processes on the host.
#[derive(Clone)]
pub struct Updater {
    inner: Arc<Inner>,
}

struct Inner {
    acquirer: Acquirer,
    filter: Arc<dyn PacketFilter>,
    source: Arc<dyn ConfigSource>,
    snapshots: SnapshotManager,
    firewall: FwOption,
    poll_interval: Duration,
    lock: Arc<Mutex<()>>,
    lock_path: PathBuf,
    runs: DashMap<RunHandle, UpdateRun>,
    next_handle: AtomicU64,
}

impl Updater {
    pub fn builder() -> UpdaterBuilder { UpdaterBuilder::default() }

    /// Start a run in the background
    ///
    /// Fails with [`Error::AlreadyRunning`] without waiting if a run is in progress.
    /// Must be called from within a tokio runtime.
    pub fn trigger_update(&self) -> Result<RunHandle> {
        let guard = self
            .inner
            .lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::AlreadyRunning)?;
        let file_lock = RunLock::acquire(&self.inner.lock_path)?;

        let handle = RunHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.runs.insert(
            handle,
            UpdateRun {
                handle,
                started_at: Local::now(),
                finished_at: None,
                status: RunStatus::Running(Stage::CheckingConnectivity),
            },
        );
        info!("UPDATE [{}] STARTED", handle);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let run = tokio::spawn({
                let inner = inner.clone();
                async move { inner.execute(handle).await }
            });
            let result = run
                .await
                .unwrap_or_else(|e| Err(Error::Aborted(format!("Run task failed: {}", e))));
            // Unlocked before the terminal status is published
            drop(file_lock);
            drop(guard);
            inner.finish(handle, result);
        });

        Ok(handle)
    }

    pub fn query_status(&self, handle: RunHandle) -> Option<RunStatus> {
        self.inner.runs.get(&handle).map(|run| run.status.clone())
    }

    pub fn run(&self, handle: RunHandle) -> Option<UpdateRun> { self.inner.runs.get(&handle).map(|run| run.clone()) }

    /// True if no run of this updater is in progress
    pub fn is_idle(&self) -> bool { self.inner.lock.try_lock().is_ok() }

    /// Poll the run until it reaches a terminal status, `None` for an unknown handle
    pub async fn wait(&self, handle: RunHandle) -> Option<RunStatus> {
        loop {
            match self.query_status(handle)? {
                status if status.is_terminal() => return Some(status),
                _ => sleep(self.inner.poll_interval).await,
            }
        }
    }
}

impl Inner {
    fn advance(&self, handle: RunHandle, stage: Stage) {
        if let Some(mut run) = self.runs.get_mut(&handle) {
            run.status = RunStatus::Running(stage);
        }
        info!("UPDATE [{}] [{}]", handle, stage);
    }

    fn finish(&self, handle: RunHandle, result: Result<()>) {
        let Some(mut run) = self.runs.get_mut(&handle) else {
            return;
        };
        run.finished_at = Some(Local::now());
        run.status = match result {
            Ok(()) => {
                info!("UPDATE [{}] SUCCEEDED", handle);
                RunStatus::Succeeded
            }
            Err(e) => {
                let stage = match run.status {
                    RunStatus::Running(stage) => stage,
                    _ => Stage::CheckingConnectivity,
                };
                error!("UPDATE [{}] FAILED AT [{}]: {}", handle, stage, e);
                RunStatus::Failed(Failure {
                    kind: e.kind(),
                    stage,
                    detail: e.to_string(),
                })
            }
        };
    }

    async fn execute(self: &Arc<Self>, handle: RunHandle) -> Result<()> {
        self.advance(handle, Stage::CheckingConnectivity);
        self.acquirer.check_connectivity().await?;

        self.advance(handle, Stage::BackingUp);
        let inner = self.clone();
        blocking(move || inner.snapshots.snapshot(&*inner.filter, &inner.firewall.set_name)).await?;

        self.advance(handle, Stage::FetchingDataset);
        let selection = self.source.selection()?;
        let countries = selection.countries;
        let whitelist = parse_whitelist(&selection.whitelist)?;
        let ports = selection.ports;
        info!(
            "SELECTION [{} COUNTRIES] [{} WHITELISTED] [{} PORTS]",
            countries.len(),
            whitelist.len(),
            ports.len()
        );

        let archive = self.acquirer.fetch().await?;
        let inner = self.clone();
        let parsed = blocking(move || inner.acquirer.parse(&archive)).await?;
        info!(
            "PARSED DATASET [{} RANGES] [{} MALFORMED]",
            parsed.ranges.len(),
            parsed.malformed
        );
        let blocks = parsed.blocks_for(&countries);
        drop(parsed);

        self.advance(handle, Stage::RebuildingBlockSet);
        let inner = self.clone();
        blocking(move || {
            let builder = BlockSetBuilder::new(&*inner.filter);
            builder.ensure_block_set(&inner.firewall.set_name)?;
            builder.rebuild(&inner.firewall.set_name, &blocks)
        })
        .await?;

        self.advance(handle, Stage::EnforcingRules);
        let inner = self.clone();
        blocking(move || {
            RuleEnforcer::new(&*inner.filter, &inner.firewall.chain).reconcile(
                &inner.firewall.set_name,
                &whitelist,
                &ports,
            )
        })
        .await?;

        self.advance(handle, Stage::RecordingCompletion);
        self.source.record_completion(Local::now())
    }
}

/// Run a kernel or CPU bound step on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Aborted(format!("Blocking task failed: {}", e)))?
}
