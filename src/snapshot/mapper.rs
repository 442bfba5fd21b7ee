use super::gleaner::{GleanerControl, ReducerBatch, SnapshotEntry};
use crate::{
    epoch::Epoch,
    log::{LogFileReader, LogKind},
    stoppable::StopControl,
    Error, Result,
};
use crossbeam_channel::Sender;
use std::{path::PathBuf, sync::Arc, thread::JoinHandle};
use tracing::{debug, error};

/// Entries buffered per destination node before a batch is dispatched.
const BUCKET_CAPACITY: usize = 1 << 10;

pub(crate) struct MapperContext {
    pub logger_id: usize,
    pub log_path: PathBuf,
    pub num_nodes: usize,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
}

/// Reads one logger's stream, routes record logs to the reducer of the
/// owning node, and funnels non-record logs into the shared buffer.
pub(crate) struct LogMapper {
    thread: Option<JoinHandle<()>>,
    stop: Arc<StopControl>,
}

impl LogMapper {
    pub fn start(
        ctx: MapperContext,
        control: Arc<GleanerControl>,
        senders: Vec<Sender<ReducerBatch>>,
    ) -> Self {
        let stop = Arc::new(StopControl::new());
        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("log_mapper_{}", ctx.logger_id))
                .spawn(move || {
                    control.actor_ready();
                    if control.wait_for_start(&stop) {
                        match run_map(&ctx, &control, &senders, &stop) {
                            Ok(true) => control.mapper_completed(),
                            Ok(false) => debug!(logger = ctx.logger_id, "mapper cancelled"),
                            Err(e) => {
                                error!(logger = ctx.logger_id, "mapper failed: {e}");
                                control.actor_failed();
                            }
                        }
                    }
                    // Dropping the senders lets the reducers run dry.
                    drop(senders);
                    control.actor_exit();
                })
                .unwrap()
        };
        Self {
            thread: Some(thread),
            stop,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.thread.is_some()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Returns false if cancelled before draining the whole file.
fn run_map(
    ctx: &MapperContext,
    control: &GleanerControl,
    senders: &[Sender<ReducerBatch>],
    stop: &StopControl,
) -> Result<bool> {
    let mut reader = LogFileReader::open(&ctx.log_path)?;
    let mut buckets: Vec<ReducerBatch> = (0..ctx.num_nodes).map(|_| Vec::new()).collect();
    let mut num_dispatched = 0u64;
    let mut num_nonrecord = 0u64;

    while let Some(record) = reader.next_record()? {
        if stop.is_stop_requested() {
            return Ok(false);
        }
        let view = record.view();
        let epoch = view.xct_id.epoch();
        if !epoch.is_valid() {
            return Err(Error::LogCorrupted);
        }
        // Only the window (base, valid_until] belongs to this snapshot.
        if ctx.valid_until_epoch.before(epoch) {
            continue;
        }
        if ctx.base_epoch.is_valid() && !ctx.base_epoch.before(epoch) {
            continue;
        }

        if view.kind.is_record() {
            let partitioner = match control.get_or_create_partitioner(view.storage_id) {
                Ok(partitioner) => partitioner,
                Err(Error::StorageNotFound(storage_id)) => {
                    // The storage was dropped after these logs were
                    // written; its records have no snapshot home.
                    debug!(storage_id, "skipping record log of a dropped storage");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let node = partitioner.node_of(view.key) % ctx.num_nodes;
            let payload = match view.kind {
                LogKind::RecordUpsert => Some(view.payload.to_vec()),
                LogKind::RecordDelete => None,
                _ => unreachable!("record kinds only"),
            };
            buckets[node].push(SnapshotEntry {
                storage_id: view.storage_id,
                key: view.key.to_vec(),
                payload,
                xct_id: view.xct_id,
            });
            num_dispatched += 1;
            if buckets[node].len() >= BUCKET_CAPACITY {
                send_bucket(&senders[node], &mut buckets[node])?;
            }
        } else {
            control.add_nonrecord_log(&record)?;
            num_nonrecord += 1;
        }
    }

    for (node, bucket) in buckets.iter_mut().enumerate() {
        if !bucket.is_empty() {
            send_bucket(&senders[node], bucket)?;
        }
    }
    debug!(
        logger = ctx.logger_id,
        num_dispatched, num_nonrecord, "mapper drained its log"
    );
    Ok(true)
}

fn send_bucket(sender: &Sender<ReducerBatch>, bucket: &mut ReducerBatch) -> Result<()> {
    // A closed channel means the reducer died; it reports its own error.
    sender
        .send(std::mem::take(bucket))
        .map_err(|_| Error::GleanerWorkerFailed)
}
