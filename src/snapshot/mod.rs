mod gleaner;
mod mapper;
mod reducer;

use crate::{
    bytes_ext::{ReadBytesExt, WriteBytesExt},
    epoch::{Epoch, EpochFramework},
    log_manager::LogManager,
    stoppable::{StopControl, Wakeup},
    storage::{StorageId, StorageManager},
    Error, Result,
};
use gleaner::{GleanerConfig, LogGleaner};
use parking_lot::{Condvar, Mutex};
use std::{
    fs::{DirBuilder, File},
    io::{BufReader, BufWriter, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{error, info};

pub type SnapshotId = u32;

/// Identifies one snapshot pass: which epochs of the logs it consolidates.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Everything at or before this epoch was covered by the previous
    /// snapshot. Invalid for the first snapshot.
    pub base_epoch: Epoch,
    /// The last epoch this snapshot covers.
    pub valid_until_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMeta {
    pub id: StorageId,
    pub name: String,
    pub entry_count: u64,
}

/// What a completed snapshot pass publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub largest_storage_id: StorageId,
    pub storages: Vec<StorageMeta>,
}

impl SnapshotMetadata {
    pub(crate) fn write_to(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&tmp_path)?);
            file.write_u32(self.id)?;
            file.write_u32(self.base_epoch.0)?;
            file.write_u32(self.valid_until_epoch.0)?;
            file.write_u32(self.largest_storage_id)?;
            file.write_u64(self.storages.len() as u64)?;
            for storage in &self.storages {
                file.write_u32(storage.id)?;
                file.write_bytes(storage.name.as_bytes())?;
                file.write_u64(storage.entry_count)?;
            }
            file.into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
                .sync_data()?;
        }
        // Atomically replace the file.
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let id = file.read_u32()?;
        let base_epoch = Epoch(file.read_u32()?);
        let valid_until_epoch = Epoch(file.read_u32()?);
        let largest_storage_id = file.read_u32()?;
        let num_storages = file.read_u64()?;
        let mut storages = Vec::with_capacity(num_storages.min(1 << 20) as usize);
        for _ in 0..num_storages {
            let storage_id = file.read_u32()?;
            let name = String::from_utf8(file.read_bytes()?).map_err(|_| Error::LogCorrupted)?;
            let entry_count = file.read_u64()?;
            storages.push(StorageMeta {
                id: storage_id,
                name,
                entry_count,
            });
        }
        // We should have reached EOF.
        if file.read(&mut [0; 1])? != 0 {
            return Err(Error::LogCorrupted);
        }
        Ok(Self {
            id,
            base_epoch,
            valid_until_epoch,
            largest_storage_id,
            storages,
        })
    }
}

pub(crate) fn metadata_path(dir: &Path, id: SnapshotId) -> PathBuf {
    dir.join(format!("snapshot-{id}-metadata"))
}

pub(crate) fn nonrecord_path(dir: &Path, id: SnapshotId) -> PathBuf {
    dir.join(format!("snapshot-{id}-nonrecord"))
}

pub(crate) fn reducer_run_path(dir: &Path, id: SnapshotId, node: usize) -> PathBuf {
    dir.join(format!("snapshot-{id}-node-{node}"))
}

#[derive(Debug, Clone, Copy)]
struct SnapshotFailed;

struct TriggerState {
    pending: bool,
    pass_count: u64,
    last: Option<std::result::Result<Snapshot, SnapshotFailed>>,
}

struct SnapshotShared {
    config: GleanerConfig,
    epoch_fw: Arc<EpochFramework>,
    log_manager: Arc<LogManager>,
    storages: Arc<StorageManager>,
    control: StopControl,
    state: Mutex<TriggerState>,
    condvar: Condvar,
    previous_snapshot_id: AtomicU32,
    previous_valid_until: AtomicU32,
}

/// Runs snapshot passes on its own thread, on demand.
pub struct SnapshotManager {
    shared: Arc<SnapshotShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    pub(crate) fn new(
        dir: PathBuf,
        options: &crate::EngineOptions,
        epoch_fw: Arc<EpochFramework>,
        log_manager: Arc<LogManager>,
        storages: Arc<StorageManager>,
    ) -> Result<Self> {
        DirBuilder::new().recursive(true).create(&dir)?;
        let shared = Arc::new(SnapshotShared {
            config: GleanerConfig::from_options(dir, options),
            epoch_fw,
            log_manager,
            storages,
            control: StopControl::new(),
            state: Mutex::new(TriggerState {
                pending: false,
                pass_count: 0,
                last: None,
            }),
            condvar: Condvar::new(),
            previous_snapshot_id: AtomicU32::new(0),
            previous_valid_until: AtomicU32::new(Epoch::INVALID.0),
        });
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("snapshot_manager".into())
                .spawn(move || run_snapshot_thread(&shared))
                .unwrap()
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The id of the most recent successful snapshot, if any.
    pub fn previous_snapshot_id(&self) -> Option<SnapshotId> {
        match self.shared.previous_snapshot_id.load(SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// Where the metadata of the given snapshot lives.
    pub fn metadata_file_path(&self, id: SnapshotId) -> PathBuf {
        metadata_path(&self.shared.config.snapshot_dir, id)
    }

    /// Requests a snapshot pass now.
    ///
    /// With `wait_completion`, blocks until the pass finishes and returns
    /// its descriptor; a failed pass surfaces as
    /// [`Error::GleanerWorkerFailed`] and publishes nothing.
    pub fn trigger_snapshot_immediate(&self, wait_completion: bool) -> Result<Option<Snapshot>> {
        if self.shared.control.is_stop_requested() {
            return Err(Error::DependentModuleUnavailable);
        }
        let mut state = self.shared.state.lock();
        let target = state.pass_count + 1;
        state.pending = true;
        self.shared.control.wakeup();
        if !wait_completion {
            return Ok(None);
        }
        while state.pass_count < target {
            if self.shared.control.is_stop_requested() {
                return Err(Error::DependentModuleUnavailable);
            }
            self.shared
                .condvar
                .wait_for(&mut state, Duration::from_millis(100));
        }
        match &state.last {
            Some(Ok(snapshot)) => Ok(Some(snapshot.clone())),
            Some(Err(SnapshotFailed)) => Err(Error::GleanerWorkerFailed),
            None => unreachable!("a finished pass always records its outcome"),
        }
    }

    /// Stops the snapshot thread. Idempotent.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.shared.control.request_stop();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_snapshot_thread(shared: &SnapshotShared) {
    info!("snapshot manager started");
    loop {
        // The trigger flag is re-checked before every sleep, so a request
        // landing while a pass runs is picked up immediately.
        let pending = std::mem::take(&mut shared.state.lock().pending);
        if !pending {
            if shared.control.sleep(Duration::from_secs(3600)) == Wakeup::StopRequested {
                break;
            }
            continue;
        }

        let result = run_snapshot_pass(shared);
        let mut state = shared.state.lock();
        state.pass_count += 1;
        match result {
            Ok(snapshot) => {
                shared.previous_snapshot_id.store(snapshot.id, SeqCst);
                shared
                    .previous_valid_until
                    .store(snapshot.valid_until_epoch.0, SeqCst);
                state.last = Some(Ok(snapshot));
            }
            Err(e) => {
                error!("snapshot pass failed: {e}");
                state.last = Some(Err(SnapshotFailed));
            }
        }
        drop(state);
        shared.condvar.notify_all();
    }
    info!("snapshot manager ended");
}

fn run_snapshot_pass(shared: &SnapshotShared) -> Result<Snapshot> {
    let id = shared.previous_snapshot_id.load(SeqCst) + 1;
    let base_epoch = Epoch(shared.previous_valid_until.load(SeqCst));

    // Close the current epoch so every committed transaction becomes
    // durable, then read how far durability actually got.
    shared.epoch_fw.advance_current_global_epoch();
    let valid_until_epoch = shared.log_manager.flush_all()?;

    let snapshot = Snapshot {
        id,
        base_epoch,
        valid_until_epoch,
    };
    info!(
        id,
        base = %base_epoch,
        valid_until = %valid_until_epoch,
        "snapshot pass starting"
    );

    let log_files: Vec<PathBuf> = (0..shared.log_manager.num_channels())
        .map(|index| shared.log_manager.log_file_path(index))
        .collect();
    let gleaner = LogGleaner::new(
        shared.config.clone(),
        shared.storages.clone(),
        snapshot.clone(),
        log_files,
    );
    gleaner.execute(&shared.control)?;
    info!(id, "snapshot pass completed");
    Ok(snapshot)
}
