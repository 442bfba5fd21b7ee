use crate::{
    access::WorkerRegistry,
    epoch::{Epoch, EpochFramework},
    stoppable::{StopControl, Wakeup},
    Error, Result,
};
use parking_lot::{Condvar, Mutex};
use std::{
    fs::{DirBuilder, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering::Relaxed, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{info, warn};

pub(crate) const LOG_FILE_NAME_PREFIX: &str = "log-";

// Architecture (single channel):
//
//             publish               flush (daemon)
//   workers ----------> channel buf --------------> file
//                                         |
//                                         v
//                              channel durable epoch
//                                         |
//                                         v
//                               global durable epoch

struct ChannelState {
    buf: Vec<u8>,
    file: File,
}

/// One logger stream. Several workers may publish into the same channel;
/// the flusher daemon is the only writer of the backing file.
pub(crate) struct LogChannel {
    state: Mutex<ChannelState>,
    /// Every byte this channel will ever flush carries an epoch later than
    /// this.
    durable_epoch: AtomicU32,
}

impl LogChannel {
    fn new(index: usize, dir: &Path, initial_durable: Epoch) -> Result<Self> {
        let path = dir.join(format!("{LOG_FILE_NAME_PREFIX}{index}"));
        let file = File::create(path)?;
        Ok(Self {
            state: Mutex::new(ChannelState {
                buf: Vec::new(),
                file,
            }),
            durable_epoch: AtomicU32::new(initial_durable.0),
        })
    }

    /// Appends a worker's committed bytes, tagged with their commit epoch.
    pub fn publish(&self, bytes: &[u8], epoch: Epoch) {
        debug_assert!(epoch.is_valid());
        if bytes.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.buf.extend_from_slice(bytes);
    }

    /// Flushes buffered bytes and declares everything up to
    /// `global_epoch - 1` durable on this channel. `global_epoch` must have
    /// been read before the in-commit guard scan of the same pass.
    fn flush(&self, global_epoch: Epoch) -> Result<()> {
        let mut state = self.state.lock();
        if !state.buf.is_empty() {
            let buf = std::mem::take(&mut state.buf);
            state.file.write_all(&buf)?;
            state.file.sync_data()?;
        }
        let next = global_epoch.one_less();
        let current = Epoch(self.durable_epoch.load(SeqCst));
        if current.before(next) {
            self.durable_epoch.store(next.0, SeqCst);
        }
        Ok(())
    }

    fn durable_epoch(&self) -> Epoch {
        Epoch(self.durable_epoch.load(SeqCst))
    }
}

/// Global durable epoch with slow-path waiters.
struct DurableEpoch {
    epoch: Mutex<Epoch>,
    condvar: Condvar,
    weak: AtomicU32,
}

impl DurableEpoch {
    fn new(initial: Epoch) -> Self {
        Self {
            epoch: Mutex::new(initial),
            condvar: Condvar::new(),
            weak: AtomicU32::new(initial.0),
        }
    }

    fn update(&self, candidate: Epoch) {
        let mut epoch = self.epoch.lock();
        if epoch.before(candidate) {
            *epoch = candidate;
            self.weak.store(candidate.0, Relaxed);
            drop(epoch);
            self.condvar.notify_all();
        }
    }
}

struct LogShared {
    dir: PathBuf,
    channels: Vec<Arc<LogChannel>>,
    epoch_fw: Arc<EpochFramework>,
    workers: Arc<WorkerRegistry>,
    durable: DurableEpoch,
    /// Slept on by the flusher daemon; the epoch advancer and
    /// `wakeup_loggers` signal it.
    wakeup: Arc<StopControl>,
}

impl LogShared {
    /// One maintenance pass: flush every channel and recompute the global
    /// durable epoch.
    ///
    /// The global epoch is read before the guard scan and the guard scan
    /// happens before the channel flushes. A commit that this pass's scan
    /// misses either published its bytes before the scan (the flush picks
    /// them up) or serialized at an epoch no earlier than the global epoch
    /// read here (so the computed durable epoch stays below it).
    fn flush_all(&self) -> Result<Epoch> {
        let global_epoch = self.epoch_fw.current_global_epoch();
        let guard_bound = self.workers.min_in_commit_epoch();

        for channel in &self.channels {
            channel.flush(global_epoch)?;
        }

        let mut candidate = global_epoch.one_less();
        if let Some(guarded) = guard_bound {
            let bound = guarded.one_less();
            if bound.before(candidate) {
                candidate = bound;
            }
        }
        for channel in &self.channels {
            let durable = channel.durable_epoch();
            if durable.before(candidate) {
                candidate = durable;
            }
        }
        self.durable.update(candidate);
        Ok(candidate)
    }
}

/// Owns the log channels and the flusher daemon, and publishes the global
/// durable epoch.
pub(crate) struct LogManager {
    shared: Arc<LogShared>,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(
        dir: &Path,
        num_channels: usize,
        flush_interval: Duration,
        epoch_fw: Arc<EpochFramework>,
        workers: Arc<WorkerRegistry>,
        wakeup: Arc<StopControl>,
    ) -> Result<Self> {
        assert!(num_channels > 0);
        DirBuilder::new().recursive(true).create(dir)?;

        let initial_durable = epoch_fw.current_global_epoch().one_less();
        let channels = (0..num_channels)
            .map(|index| Ok(Arc::new(LogChannel::new(index, dir, initial_durable)?)))
            .collect::<Result<Vec<_>>>()?;

        let shared = Arc::new(LogShared {
            dir: dir.to_path_buf(),
            channels,
            epoch_fw,
            workers,
            durable: DurableEpoch::new(initial_durable),
            wakeup,
        });
        let daemon = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("log_flusher".into())
                .spawn(move || run_daemon(&shared, flush_interval))
                .unwrap()
        };

        Ok(Self {
            shared,
            daemon: Mutex::new(Some(daemon)),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.shared.channels.len()
    }

    pub fn channel(&self, worker_id: usize) -> Arc<LogChannel> {
        let channels = &self.shared.channels;
        channels[worker_id % channels.len()].clone()
    }

    pub fn log_file_path(&self, channel_index: usize) -> PathBuf {
        self.shared
            .dir
            .join(format!("{LOG_FILE_NAME_PREFIX}{channel_index}"))
    }

    /// Wakes the flusher daemon. Invoked after every epoch bump and by
    /// commit publication.
    pub fn wakeup_loggers(&self) {
        self.shared.wakeup.wakeup();
    }

    pub fn durable_global_epoch(&self) -> Epoch {
        *self.shared.durable.epoch.lock()
    }

    /// Non-atomic hint of the durable epoch.
    pub fn durable_global_epoch_weak(&self) -> Epoch {
        Epoch(self.shared.durable.weak.load(Relaxed))
    }

    /// Synchronously flushes all channels and advances the durable epoch
    /// as far as in-flight commits allow.
    pub fn flush_all(&self) -> Result<Epoch> {
        self.shared.flush_all()
    }

    /// Blocks until the given epoch is durable.
    ///
    /// Expiry of the timeout returns [`Error::Timeout`]; the commit the
    /// caller waits for stays committed and becomes durable later.
    pub fn wait_until_durable(&self, epoch: Epoch, timeout: Option<Duration>) -> Result<Epoch> {
        if !epoch.is_valid() {
            return Ok(self.durable_global_epoch());
        }
        let mut durable = self.shared.durable.epoch.lock();
        match timeout {
            None => {
                self.shared
                    .durable
                    .condvar
                    .wait_while(&mut durable, |durable| durable.before(epoch));
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                self.shared.durable.condvar.wait_while_until(
                    &mut durable,
                    |durable| durable.before(epoch),
                    deadline,
                );
                if durable.before(epoch) {
                    return Err(Error::Timeout);
                }
            }
        }
        Ok(*durable)
    }

    /// Stops the daemon and performs a final flush. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.wakeup.request_stop();
        let daemon = self.daemon.lock().take();
        if let Some(daemon) = daemon {
            let _ = daemon.join();
            self.shared.flush_all()?;
        }
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("final log flush failed: {e}");
        }
    }
}

fn run_daemon(shared: &LogShared, flush_interval: Duration) {
    info!(channels = shared.channels.len(), "log flusher started");
    loop {
        let wakeup = shared.wakeup.sleep(flush_interval);
        if wakeup == Wakeup::StopRequested {
            break;
        }
        if let Err(e) = shared.flush_all() {
            warn!("log flush failed: {e}");
        }
    }
    info!("log flusher ended");
}
