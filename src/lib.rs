//! A main-memory OLTP transaction core.
//!
//! Workers run transactions under epoch-based optimistic concurrency
//! control: reads are recorded, writes are staged in a per-worker redo log
//! buffer, and a three-phase precommit locks, verifies, and applies the
//! write set at a fenced serialization point. A dedicated thread advances
//! the global epoch; the log subsystem declares epochs durable; a snapshot
//! pass consolidates durable logs with a map/reduce gleaner.
//!
//! Storage data structures live outside this crate and plug in through the
//! [`Storage`] trait.

mod access;
mod bytes_ext;
mod commit;
mod epoch;
mod lock;
mod log;
mod log_manager;
mod snapshot;
mod stoppable;
mod storage;
mod xct_id;

pub use access::{
    ApplyContext, IsolationLevel, LockFreeWriteAccess, OwnerPtr, PageVersionAccess, PointerAccess,
    ReadAccess, WriteAccess, Xct,
};
pub use epoch::Epoch;
pub use lock::{McsBlockIndex, McsBlockPool, McsLock};
pub use log::{LogKind, LogRecordView, ThreadLogBuffer};
pub use snapshot::{Snapshot, SnapshotId, SnapshotManager, SnapshotMetadata, StorageMeta};
pub use storage::{Partitioner, Storage, StorageId, StorageManager};
pub use xct_id::{OwnerId, XctId, MAX_ORDINAL};

use access::{WorkerRegistry, WorkerSharedState};
use commit::CommitContext;
use epoch::EpochFramework;
use log_manager::{LogChannel, LogManager};
use stoppable::StopControl;
use std::{
    path::Path,
    sync::{
        atomic::{fence, AtomicU64, AtomicUsize, Ordering::Acquire, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transaction is already running on this worker.
    #[error("a transaction is already running on this worker")]
    XctAlreadyRunning,

    /// No transaction is running on this worker.
    #[error("no transaction is running on this worker")]
    NoXct,

    /// Optimistic verification failed, or write-set records moved out of
    /// reach. The caller retries the whole transaction.
    #[error("optimistic verification failed; retry the transaction")]
    RaceAbort,

    /// A module was used before its dependencies were ready or after they
    /// were torn down.
    #[error("a dependent module is not available")]
    DependentModuleUnavailable,

    /// A mapper or reducer failed; the snapshot attempt was aborted and no
    /// partial snapshot was published.
    #[error("a snapshot worker failed; the snapshot was aborted")]
    GleanerWorkerFailed,

    /// A durability wait expired. The transaction stays committed and
    /// becomes durable whenever the log subsystem catches up.
    #[error("timed out waiting for durability")]
    Timeout,

    #[error("storage {0} is already registered")]
    StorageExists(StorageId),

    #[error("storage {0} is not registered")]
    StorageNotFound(StorageId),

    #[error("log data is corrupted")]
    LogCorrupted,

    /// The shared buffer for non-record logs filled up during a snapshot
    /// pass. The pass fails rather than truncating.
    #[error("the non-record log buffer is full")]
    NonRecordBufferFull,

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    /// Several components failed during shutdown.
    #[error("{} errors during shutdown", .0.len())]
    Shutdown(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collects errors from a multi-step teardown and reports them all at
/// once instead of stopping at the first.
pub(crate) struct ErrorBatch {
    errors: Vec<Error>,
}

impl ErrorBatch {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    pub fn summarize(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.pop().unwrap()),
            _ => Err(Error::Shutdown(self.errors)),
        }
    }
}

/// Engine configuration. Construct via [`Engine::options`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    epoch_advance_interval: Duration,
    log_flush_interval: Duration,
    group_count: usize,
    loggers_per_node: usize,
    snapshot_nonrecord_buffer_size: usize,
    use_numa_alloc: bool,
    interleave_numa_alloc: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            epoch_advance_interval: Duration::from_millis(10),
            log_flush_interval: Duration::from_millis(10),
            group_count: 1,
            loggers_per_node: 1,
            snapshot_nonrecord_buffer_size: 1 << 21,
            use_numa_alloc: false,
            interleave_numa_alloc: false,
        }
    }
}

impl EngineOptions {
    /// How often the global epoch advances when nobody asks for it.
    pub fn epoch_advance_interval(mut self, interval: Duration) -> Self {
        self.epoch_advance_interval = interval;
        self
    }

    /// How often the log flusher runs between wakeups.
    pub fn log_flush_interval(mut self, interval: Duration) -> Self {
        self.log_flush_interval = interval;
        self
    }

    /// Number of NUMA nodes. Drives the reducer fan-out of snapshot
    /// passes.
    pub fn group_count(mut self, count: usize) -> Self {
        assert!(count > 0);
        self.group_count = count;
        self
    }

    /// Logger streams per node. Drives the mapper fan-out of snapshot
    /// passes.
    pub fn loggers_per_node(mut self, count: usize) -> Self {
        assert!(count > 0);
        self.loggers_per_node = count;
        self
    }

    /// Capacity of the shared buffer for non-record logs during a
    /// snapshot pass. A pass that outgrows it fails; it never truncates.
    pub fn snapshot_nonrecord_buffer_size(mut self, size: usize) -> Self {
        self.snapshot_nonrecord_buffer_size = size;
        self
    }

    /// Prefer node-local allocation for snapshot buffers.
    pub fn use_numa_alloc(mut self, enable: bool) -> Self {
        self.use_numa_alloc = enable;
        self
    }

    /// Interleave snapshot buffer pages across nodes.
    pub fn interleave_numa_alloc(mut self, enable: bool) -> Self {
        self.interleave_numa_alloc = enable;
        self
    }

    pub fn open(self, dir: impl AsRef<Path>) -> Result<Engine> {
        Engine::new(self, dir.as_ref())
    }
}

/// The engine owns every manager; workers hold borrows back into it.
///
/// Shutdown runs in reverse order of construction: snapshots stop first,
/// then the log flusher (with a final flush), then the epoch advancer.
pub struct Engine {
    // Field order is drop order.
    snapshot_manager: SnapshotManager,
    log_manager: Arc<LogManager>,
    epoch_fw: Arc<EpochFramework>,
    storage_manager: Arc<StorageManager>,
    workers: Arc<WorkerRegistry>,
    next_worker_id: AtomicUsize,
}

impl Engine {
    pub fn options() -> EngineOptions {
        EngineOptions::default()
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::options().open(dir)
    }

    fn new(options: EngineOptions, dir: &Path) -> Result<Self> {
        let workers = Arc::new(WorkerRegistry::new());
        let logger_wakeup = Arc::new(StopControl::new());
        let epoch_fw = Arc::new(EpochFramework::new(
            options.epoch_advance_interval,
            logger_wakeup.clone(),
        ));
        let log_manager = Arc::new(LogManager::new(
            &dir.join("logs"),
            options.group_count * options.loggers_per_node,
            options.log_flush_interval,
            epoch_fw.clone(),
            workers.clone(),
            logger_wakeup,
        )?);
        let storage_manager = Arc::new(StorageManager::new());
        let snapshot_manager = SnapshotManager::new(
            dir.join("snapshots"),
            &options,
            epoch_fw.clone(),
            log_manager.clone(),
            storage_manager.clone(),
        )?;
        info!(?dir, "engine initialized");
        Ok(Self {
            snapshot_manager,
            log_manager,
            epoch_fw,
            storage_manager,
            workers,
            next_worker_id: AtomicUsize::new(0),
        })
    }

    /// Spawns a [`Worker`], which can be used to run transactions.
    ///
    /// Spawn one worker per thread and reuse it across transactions so its
    /// buffers stay allocated.
    pub fn worker(&self) -> Worker<'_> {
        let id = self.next_worker_id.fetch_add(1, SeqCst);
        Worker {
            engine: self,
            id,
            xct: Xct::new(),
            log_buffer: ThreadLogBuffer::new(),
            mcs_pool: McsBlockPool::new(),
            channel: self.log_manager.channel(id),
            shared: self.workers.register(),
        }
    }

    pub fn storages(&self) -> &StorageManager {
        &self.storage_manager
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    pub fn current_global_epoch(&self) -> Epoch {
        self.epoch_fw.current_global_epoch()
    }

    pub fn current_global_epoch_weak(&self) -> Epoch {
        self.epoch_fw.current_global_epoch_weak()
    }

    /// Forces an epoch bump and returns the new current epoch.
    pub fn advance_current_global_epoch(&self) -> Epoch {
        self.epoch_fw.advance_current_global_epoch()
    }

    pub fn durable_global_epoch(&self) -> Epoch {
        self.log_manager.durable_global_epoch()
    }

    pub fn durable_global_epoch_weak(&self) -> Epoch {
        self.log_manager.durable_global_epoch_weak()
    }

    /// Waits until `commit_epoch` is durable.
    ///
    /// A timeout returns [`Error::Timeout`] without affecting the
    /// transaction, which stays committed.
    pub fn wait_for_commit(&self, commit_epoch: Epoch, timeout: Option<Duration>) -> Result<Epoch> {
        fence(Acquire);
        if commit_epoch.before(self.epoch_fw.current_global_epoch()) {
            // Durability needs the epoch closed; hurry the advancer up.
            self.epoch_fw.wakeup_advancer();
        }
        self.log_manager.wait_until_durable(commit_epoch, timeout)
    }

    /// Stops every component, collecting all shutdown errors.
    pub fn uninitialize(self) -> Result<()> {
        info!("uninitializing engine");
        let mut batch = ErrorBatch::new();
        batch.push(self.snapshot_manager.shutdown());
        batch.push(self.log_manager.shutdown());
        self.epoch_fw.shutdown();
        batch.summarize()
    }
}

/// A per-thread handle for running transactions.
///
/// Storage implementations record their observations and modifications
/// through the `add_to_*` methods while a transaction is active.
pub struct Worker<'a> {
    engine: &'a Engine,
    id: usize,
    xct: Xct,
    log_buffer: ThreadLogBuffer,
    mcs_pool: McsBlockPool,
    channel: Arc<LogChannel>,
    shared: Arc<WorkerSharedState>,
}

impl Worker<'_> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn xct(&self) -> &Xct {
        &self.xct
    }

    /// The committed and tail offsets of this worker's log buffer. Equal
    /// whenever no transaction has staged writes.
    pub fn log_offsets(&self) -> (usize, usize) {
        (
            self.log_buffer.offset_committed(),
            self.log_buffer.offset_tail(),
        )
    }

    pub fn begin_xct(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.xct.is_active() {
            return Err(Error::XctAlreadyRunning);
        }
        debug_assert_eq!(
            self.log_buffer.offset_committed(),
            self.log_buffer.offset_tail()
        );
        self.xct.activate(isolation);
        debug!(worker = self.id, "began new transaction");
        Ok(())
    }

    /// Runs the commit protocol on the current transaction.
    ///
    /// On success the transaction is committed as of the returned epoch;
    /// pass it to [`Engine::wait_for_commit`] for durability. On
    /// [`Error::RaceAbort`] every staged write is discarded and the caller
    /// retries the whole transaction.
    pub fn precommit_xct(&mut self) -> Result<Epoch> {
        if !self.xct.is_active() {
            return Err(Error::NoXct);
        }
        let result = {
            let mut ctx = CommitContext {
                worker_id: self.id,
                xct: &mut self.xct,
                log_buffer: &mut self.log_buffer,
                mcs_pool: &mut self.mcs_pool,
                shared: self.shared.as_ref(),
                channel: self.channel.as_ref(),
                epoch_fw: self.engine.epoch_fw.as_ref(),
                log_manager: self.engine.log_manager.as_ref(),
                storages: self.engine.storage_manager.as_ref(),
            };
            commit::precommit_xct(&mut ctx)
        };
        self.xct.deactivate();
        if result.is_err() {
            debug!(worker = self.id, "aborting because of contention");
            self.log_buffer.discard_current_xct_log();
        }
        result
    }

    pub fn abort_xct(&mut self) -> Result<()> {
        if !self.xct.is_active() {
            return Err(Error::NoXct);
        }
        self.xct.deactivate();
        self.log_buffer.discard_current_xct_log();
        debug!(worker = self.id, "aborted transaction");
        Ok(())
    }

    /// Records an observed record.
    pub fn add_to_read_set(
        &mut self,
        storage_id: StorageId,
        owner_id_address: OwnerPtr,
        observed_xct_id: XctId,
    ) -> Result<()> {
        self.require_active()?;
        self.xct.add_to_read_set(ReadAccess {
            storage_id,
            owner_id_address,
            observed_xct_id,
        });
        Ok(())
    }

    /// Stages a record modification: the log record goes into the
    /// worker's log buffer and the record joins the write set.
    pub fn add_to_write_set(
        &mut self,
        storage_id: StorageId,
        owner_id_address: OwnerPtr,
        payload_address: *mut u8,
        kind: LogKind,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        self.require_active()?;
        assert!(kind.is_record());
        let log_offset = self.log_buffer.push_record(kind, storage_id, key, payload);
        self.xct.add_to_write_set(WriteAccess {
            storage_id,
            owner_id_address,
            payload_address,
            log_offset,
            mcs_block: None,
        });
        Ok(())
    }

    /// Stages a modification of an append-only storage; applied without
    /// locking at commit time.
    pub fn add_to_lock_free_write_set(
        &mut self,
        storage_id: StorageId,
        kind: LogKind,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        self.require_active()?;
        let log_offset = self.log_buffer.push_record(kind, storage_id, key, payload);
        self.xct.add_to_lock_free_write_set(LockFreeWriteAccess {
            storage_id,
            log_offset,
        });
        Ok(())
    }

    /// Records an observed pointer slot.
    pub fn add_to_pointer_set(&mut self, address: &AtomicU64, observed: u64) -> Result<()> {
        self.require_active()?;
        self.xct.add_to_pointer_set(PointerAccess {
            address: address.into(),
            observed,
        });
        Ok(())
    }

    /// Records an observed page version.
    pub fn add_to_page_version_set(&mut self, address: &AtomicU64, observed: u64) -> Result<()> {
        self.require_active()?;
        self.xct.add_to_page_version_set(PageVersionAccess {
            address: address.into(),
            observed,
        });
        Ok(())
    }

    /// Registers a storage and commits its creation through a tiny system
    /// transaction, so snapshots can enumerate it.
    pub fn register_storage(&mut self, storage: Arc<dyn Storage>) -> Result<Epoch> {
        if self.xct.is_active() {
            return Err(Error::XctAlreadyRunning);
        }
        self.engine.storage_manager.register(storage.clone())?;
        self.begin_xct(IsolationLevel::Serializable)?;
        self.add_to_lock_free_write_set(
            storage.id(),
            LogKind::StorageCreate,
            &[],
            storage.name().as_bytes(),
        )?;
        self.precommit_xct()
    }

    /// Drops a storage and commits the drop.
    pub fn deregister_storage(&mut self, storage_id: StorageId) -> Result<Epoch> {
        if self.xct.is_active() {
            return Err(Error::XctAlreadyRunning);
        }
        self.engine.storage_manager.deregister(storage_id)?;
        self.begin_xct(IsolationLevel::Serializable)?;
        self.add_to_lock_free_write_set(storage_id, LogKind::StorageDrop, &[], &[])?;
        self.precommit_xct()
    }

    fn require_active(&self) -> Result<()> {
        if self.xct.is_active() {
            Ok(())
        } else {
            Err(Error::NoXct)
        }
    }
}
