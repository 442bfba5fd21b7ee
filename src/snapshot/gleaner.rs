use super::{
    mapper::{LogMapper, MapperContext},
    metadata_path, nonrecord_path,
    reducer::LogReducer,
    reducer_run_path, Snapshot, SnapshotMetadata, StorageMeta,
};
use crate::{
    log::OwnedLogRecord,
    stoppable::StopControl,
    storage::{Partitioner, StorageId, StorageManager},
    xct_id::XctId,
    Error, Result,
};
use parking_lot::{Condvar, Mutex};
use std::{
    cell::UnsafeCell,
    collections::HashMap,
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub(crate) struct GleanerConfig {
    pub snapshot_dir: PathBuf,
    pub num_nodes: usize,
    pub loggers_per_node: usize,
    pub nonrecord_buffer_capacity: usize,
    /// Allocation policy for the pass's buffers. This build allocates
    /// through the global allocator either way; the policy is surfaced in
    /// the pass's logs so operators can correlate placement effects.
    pub use_numa_alloc: bool,
    pub interleave_numa_alloc: bool,
}

impl GleanerConfig {
    pub fn from_options(snapshot_dir: PathBuf, options: &crate::EngineOptions) -> Self {
        Self {
            snapshot_dir,
            num_nodes: options.group_count,
            loggers_per_node: options.loggers_per_node,
            nonrecord_buffer_capacity: options.snapshot_nonrecord_buffer_size,
            use_numa_alloc: options.use_numa_alloc,
            interleave_numa_alloc: options.interleave_numa_alloc,
        }
    }
}

/// One record-log occurrence headed for a reducer.
pub(crate) struct SnapshotEntry {
    pub storage_id: StorageId,
    pub key: Vec<u8>,
    /// Absent for deletes.
    pub payload: Option<Vec<u8>>,
    pub xct_id: XctId,
}

pub(crate) type ReducerBatch = Vec<SnapshotEntry>;

pub(crate) struct RootPageInfo {
    pub storage_id: StorageId,
    pub entry_count: u64,
}

/// Shared append buffer for non-record logs. Reservation is a fetch-add
/// on the cursor; the copy into the reserved region is uncontended.
/// A reservation past the capacity fails the pass; it never truncates.
struct NonrecordBuffer {
    cells: Box<[UnsafeCell<u8>]>,
    pos: AtomicUsize,
}

// Reserved regions are disjoint, so concurrent appends never alias.
unsafe impl Sync for NonrecordBuffer {}

impl NonrecordBuffer {
    fn new(capacity: usize) -> Self {
        let cells = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            cells,
            pos: AtomicUsize::new(0),
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let begin = self.pos.fetch_add(bytes.len(), SeqCst);
        let end = begin.checked_add(bytes.len()).ok_or(Error::NonRecordBufferFull)?;
        if end > self.cells.len() {
            return Err(Error::NonRecordBufferFull);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cells[begin].get(), bytes.len());
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.pos.load(SeqCst).min(self.cells.len())
    }

    /// Only valid once every appender is quiescent.
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.cells.as_ptr().cast(), self.len()) }
    }
}

/// State shared between the gleaner loop and its mappers and reducers.
pub(crate) struct GleanerControl {
    pub ready_to_start_count: AtomicUsize,
    pub completed_count: AtomicUsize,
    pub completed_mapper_count: AtomicUsize,
    pub error_count: AtomicUsize,
    pub exit_count: AtomicUsize,
    /// The gleaner loop sleeps here; actors wake it on every transition.
    pub wakeup: StopControl,
    start_mutex: Mutex<bool>,
    start_condvar: Condvar,
    partitioners: Mutex<HashMap<StorageId, Arc<dyn Partitioner>>>,
    nonrecord: NonrecordBuffer,
    root_info: Mutex<Vec<RootPageInfo>>,
    storages: Arc<StorageManager>,
    num_nodes: usize,
}

impl GleanerControl {
    fn new(storages: Arc<StorageManager>, num_nodes: usize, nonrecord_capacity: usize) -> Self {
        Self {
            ready_to_start_count: AtomicUsize::new(0),
            completed_count: AtomicUsize::new(0),
            completed_mapper_count: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            exit_count: AtomicUsize::new(0),
            wakeup: StopControl::new(),
            start_mutex: Mutex::new(false),
            start_condvar: Condvar::new(),
            partitioners: Mutex::new(HashMap::new()),
            nonrecord: NonrecordBuffer::new(nonrecord_capacity),
            root_info: Mutex::new(Vec::new()),
            storages,
            num_nodes,
        }
    }

    /// Returns the partitioner for the storage, creating it on first use.
    ///
    /// Creation runs outside the lock because it may be expensive; a
    /// concurrently created duplicate is discarded on re-check, so callers
    /// always observe one stable partitioner per storage.
    pub fn get_or_create_partitioner(&self, storage_id: StorageId) -> Result<Arc<dyn Partitioner>> {
        {
            let partitioners = self.partitioners.lock();
            if let Some(partitioner) = partitioners.get(&storage_id) {
                return Ok(partitioner.clone());
            }
        }

        let storage = self
            .storages
            .get(storage_id)
            .ok_or(Error::StorageNotFound(storage_id))?;
        let partitioner = storage.make_partitioner(self.num_nodes)?;

        let mut partitioners = self.partitioners.lock();
        match partitioners.get(&storage_id) {
            Some(existing) => Ok(existing.clone()),
            None => {
                partitioners.insert(storage_id, partitioner.clone());
                Ok(partitioner)
            }
        }
    }

    pub fn add_nonrecord_log(&self, record: &OwnedLogRecord) -> Result<()> {
        debug_assert!(!record.view().kind.is_record());
        self.nonrecord.append(record.bytes())
    }

    pub fn report_root_info(&self, infos: Vec<RootPageInfo>) {
        self.root_info.lock().extend(infos);
    }

    pub fn actor_ready(&self) {
        self.ready_to_start_count.fetch_add(1, SeqCst);
        self.wakeup.wakeup();
    }

    pub fn mapper_completed(&self) {
        self.completed_mapper_count.fetch_add(1, SeqCst);
        self.completed_count.fetch_add(1, SeqCst);
        self.wakeup.wakeup();
    }

    pub fn reducer_completed(&self) {
        self.completed_count.fetch_add(1, SeqCst);
        self.wakeup.wakeup();
    }

    pub fn actor_failed(&self) {
        self.error_count.fetch_add(1, SeqCst);
        self.wakeup.wakeup();
    }

    pub fn actor_exit(&self) {
        self.exit_count.fetch_add(1, SeqCst);
        self.wakeup.wakeup();
    }

    fn signal_start(&self) {
        *self.start_mutex.lock() = true;
        self.start_condvar.notify_all();
    }

    /// Parks the calling actor until the gleaner releases the whole cohort
    /// together. Returns false if the actor was cancelled first.
    pub fn wait_for_start(&self, stop: &StopControl) -> bool {
        let mut started = self.start_mutex.lock();
        while !*started {
            if stop.is_stop_requested() {
                return false;
            }
            self.start_condvar
                .wait_for(&mut started, Duration::from_millis(10));
        }
        true
    }
}

#[derive(Debug)]
pub(crate) struct GleanerStats {
    pub ready_to_start: usize,
    pub completed: usize,
    pub completed_mappers: usize,
    pub errors: usize,
    pub exits: usize,
    pub nonrecord_bytes: usize,
}

/// Orchestrates one snapshot pass: `loggers_per_node` mappers per node
/// feed one reducer per node, and the consolidated outputs become the
/// snapshot's root metadata.
pub(crate) struct LogGleaner {
    config: GleanerConfig,
    storages: Arc<StorageManager>,
    snapshot: Snapshot,
    log_files: Vec<PathBuf>,
}

impl LogGleaner {
    pub fn new(
        config: GleanerConfig,
        storages: Arc<StorageManager>,
        snapshot: Snapshot,
        log_files: Vec<PathBuf>,
    ) -> Self {
        assert_eq!(
            log_files.len(),
            config.num_nodes * config.loggers_per_node,
            "one mapper per logger stream"
        );
        Self {
            config,
            storages,
            snapshot,
            log_files,
        }
    }

    /// Runs the pass to completion or cancellation. No snapshot artifacts
    /// are published unless every mapper and reducer succeeded.
    pub fn execute(&self, parent: &StopControl) -> Result<()> {
        let (stats, success) = self.run(parent)?;
        if success {
            Ok(())
        } else {
            warn!(?stats, "snapshot pass failed or was cancelled");
            Err(Error::GleanerWorkerFailed)
        }
    }

    fn run(&self, parent: &StopControl) -> Result<(GleanerStats, bool)> {
        let num_mappers = self.log_files.len();
        let num_reducers = self.config.num_nodes;
        let total = num_mappers + num_reducers;
        let control = Arc::new(GleanerControl::new(
            self.storages.clone(),
            self.config.num_nodes,
            self.config.nonrecord_buffer_capacity,
        ));
        info!(
            num_mappers,
            num_reducers,
            use_numa_alloc = self.config.use_numa_alloc,
            interleave_numa_alloc = self.config.interleave_numa_alloc,
            "log gleaner pass starting"
        );

        let mut reducers = Vec::with_capacity(num_reducers);
        let mut senders = Vec::with_capacity(num_reducers);
        for node in 0..num_reducers {
            let (tx, rx) = crossbeam_channel::unbounded::<ReducerBatch>();
            senders.push(tx);
            reducers.push(LogReducer::start(
                node,
                rx,
                control.clone(),
                reducer_run_path(&self.config.snapshot_dir, self.snapshot.id, node),
            ));
        }
        let mut mappers = Vec::with_capacity(num_mappers);
        for (logger_id, log_path) in self.log_files.iter().enumerate() {
            mappers.push(LogMapper::start(
                MapperContext {
                    logger_id,
                    log_path: log_path.clone(),
                    num_nodes: self.config.num_nodes,
                    base_epoch: self.snapshot.base_epoch,
                    valid_until_epoch: self.snapshot.valid_until_epoch,
                },
                control.clone(),
                senders.clone(),
            ));
        }
        // Reducers drain until the last mapper-held sender drops.
        drop(senders);

        // Start barrier: mappers must not publish partitioned logs before
        // the reducers are draining, so the whole cohort parks until
        // everyone reports ready.
        loop {
            debug_assert!(control.ready_to_start_count.load(SeqCst) <= total);
            if control.error_count.load(SeqCst) > 0
                || parent.is_stop_requested()
                || control.ready_to_start_count.load(SeqCst) == total
            {
                break;
            }
            control.wakeup.sleep(Duration::from_millis(10));
        }
        info!("mappers and reducers initialized; starting processing");
        control.signal_start();

        let mut mappers_torn_down = false;
        while control.error_count.load(SeqCst) == 0 {
            if parent.is_stop_requested() || control.completed_count.load(SeqCst) == total {
                break;
            }
            if !mappers_torn_down
                && control.completed_mapper_count.load(SeqCst) == num_mappers
            {
                // The reducers' heaviest phase is still ahead; reclaim the
                // mappers' memory right away.
                info!("all mappers are done; releasing their resources");
                cancel_mappers(&mut mappers);
                mappers_torn_down = true;
            }
            control.wakeup.sleep(Duration::from_millis(10));
        }

        let mut success = control.error_count.load(SeqCst) == 0
            && control.completed_count.load(SeqCst) == total;
        if success {
            if let Err(e) = self.construct_root_pages(&control) {
                warn!("root page construction failed: {e}");
                success = false;
            }
        } else {
            warn!("snapshot pass did not complete; skipping root page construction");
        }

        if !mappers_torn_down {
            cancel_mappers(&mut mappers);
        }
        cancel_reducers(&mut reducers);

        let stats = GleanerStats {
            ready_to_start: control.ready_to_start_count.load(SeqCst),
            completed: control.completed_count.load(SeqCst),
            completed_mappers: control.completed_mapper_count.load(SeqCst),
            errors: control.error_count.load(SeqCst),
            exits: control.exit_count.load(SeqCst),
            nonrecord_bytes: control.nonrecord.len(),
        };
        debug_assert_eq!(stats.exits, total);
        info!(?stats, "log gleaner pass ended");
        Ok((stats, success))
    }

    /// Consolidates the reducers' per-storage outputs and the storage
    /// registry into the snapshot's metadata, and dumps the accumulated
    /// non-record logs next to it. This is the publication point of the
    /// snapshot.
    fn construct_root_pages(&self, control: &GleanerControl) -> Result<()> {
        let mut counts: HashMap<StorageId, u64> = HashMap::new();
        for info in control.root_info.lock().iter() {
            *counts.entry(info.storage_id).or_default() += info.entry_count;
        }

        let storages = self.storages.list();
        let metas: Vec<StorageMeta> = storages
            .iter()
            .map(|storage| StorageMeta {
                id: storage.id(),
                name: storage.name().to_owned(),
                entry_count: counts.get(&storage.id()).copied().unwrap_or(0),
            })
            .collect();
        let metadata = SnapshotMetadata {
            id: self.snapshot.id,
            base_epoch: self.snapshot.base_epoch,
            valid_until_epoch: self.snapshot.valid_until_epoch,
            largest_storage_id: self.storages.largest_storage_id(),
            storages: metas,
        };

        let mut nonrecord_file =
            File::create(nonrecord_path(&self.config.snapshot_dir, self.snapshot.id))?;
        nonrecord_file.write_all(control.nonrecord.as_slice())?;
        nonrecord_file.sync_data()?;

        metadata.write_to(&metadata_path(&self.config.snapshot_dir, self.snapshot.id))
    }
}

/// Two passes: request every initialized actor to stop, then block on each.
fn cancel_mappers(mappers: &mut [LogMapper]) {
    info!("requesting mappers to stop");
    for mapper in mappers.iter() {
        if mapper.is_initialized() {
            mapper.request_stop();
        } else {
            warn!("mapper is not initialized during cancellation");
        }
    }
    for mapper in mappers.iter_mut() {
        mapper.join();
    }
    info!("all mappers stopped");
}

fn cancel_reducers(reducers: &mut [LogReducer]) {
    info!("requesting reducers to stop");
    for reducer in reducers.iter() {
        if reducer.is_initialized() {
            reducer.request_stop();
        } else {
            warn!("reducer is not initialized during cancellation");
        }
    }
    for reducer in reducers.iter_mut() {
        reducer.join();
    }
    info!("all reducers stopped");
}
