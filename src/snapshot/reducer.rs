use super::gleaner::{GleanerControl, ReducerBatch, RootPageInfo, SnapshotEntry};
use crate::{bytes_ext::WriteBytesExt, stoppable::StopControl, xct_id::XctId, Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::{
    cmp::Ordering,
    fs::File,
    io::BufWriter,
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, error};

/// Consolidates the record logs routed to one node into a sorted snapshot
/// run file, keeping only the latest version of each record.
pub(crate) struct LogReducer {
    thread: Option<JoinHandle<()>>,
    stop: Arc<StopControl>,
}

impl LogReducer {
    pub fn start(
        node: usize,
        receiver: Receiver<ReducerBatch>,
        control: Arc<GleanerControl>,
        run_path: PathBuf,
    ) -> Self {
        let stop = Arc::new(StopControl::new());
        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("log_reducer_{node}"))
                .spawn(move || {
                    control.actor_ready();
                    if control.wait_for_start(&stop) {
                        match run_reduce(node, &receiver, &run_path, &stop) {
                            Ok(Some(infos)) => {
                                control.report_root_info(infos);
                                control.reducer_completed();
                            }
                            Ok(None) => debug!(node, "reducer cancelled"),
                            Err(e) => {
                                error!(node, "reducer failed: {e}");
                                control.actor_failed();
                            }
                        }
                    }
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

/// Returns the per-storage entry counts of the run file, or `None` if
/// cancelled mid-drain.
fn run_reduce(
    node: usize,
    receiver: &Receiver<ReducerBatch>,
    run_path: &PathBuf,
    stop: &StopControl,
) -> Result<Option<Vec<RootPageInfo>>> {
    // Surfacing output-path problems now beats failing after the heavy
    // consolidation phase.
    let file = File::create(run_path)?;

    let mut entries: Vec<SnapshotEntry> = Vec::new();
    loop {
        if stop.is_stop_requested() {
            return Ok(None);
        }
        match receiver.recv_timeout(Duration::from_millis(20)) {
            Ok(batch) => entries.extend(batch),
            Err(RecvTimeoutError::Timeout) => continue,
            // Every mapper dropped its sender; the stream is complete.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // The latest version of each record wins; deleted records drop out.
    entries.sort_by(|a, b| {
        (a.storage_id, &a.key)
            .cmp(&(b.storage_id, &b.key))
            .then_with(|| xct_order(a.xct_id, b.xct_id))
    });

    let mut writer = BufWriter::new(file);
    let mut infos: Vec<RootPageInfo> = Vec::new();
    let mut index = 0;
    while index < entries.len() {
        let mut last = index;
        while last + 1 < entries.len()
            && entries[last + 1].storage_id == entries[index].storage_id
            && entries[last + 1].key == entries[index].key
        {
            last += 1;
        }
        let entry = &entries[last];
        if let Some(payload) = &entry.payload {
            writer.write_u32(entry.storage_id)?;
            writer.write_bytes(&entry.key)?;
            writer.write_bytes(payload)?;
            match infos.last_mut() {
                Some(info) if info.storage_id == entry.storage_id => info.entry_count += 1,
                _ => infos.push(RootPageInfo {
                    storage_id: entry.storage_id,
                    entry_count: 1,
                }),
            }
        }
        index = last + 1;
    }
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_data()?;

    debug!(
        node,
        consolidated = entries.len(),
        storages = infos.len(),
        "reducer finished"
    );
    Ok(Some(infos))
}

fn xct_order(a: XctId, b: XctId) -> Ordering {
    if a.before(b) {
        Ordering::Less
    } else if b.before(a) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::{run_reduce, SnapshotEntry};
    use crate::{bytes_ext::ReadBytesExt, epoch::Epoch, stoppable::StopControl, xct_id::XctId};
    use std::io::Read;

    fn entry(
        storage_id: u32,
        key: &[u8],
        payload: Option<&[u8]>,
        epoch: u32,
        ordinal: u32,
    ) -> SnapshotEntry {
        SnapshotEntry {
            storage_id,
            key: key.to_vec(),
            payload: payload.map(|p| p.to_vec()),
            xct_id: XctId::new(Epoch(epoch), ordinal),
        }
    }

    #[test]
    fn last_version_wins_and_tombstones_drop_out() {
        let dir = tempfile::tempdir().unwrap();
        let run_path = dir.path().join("run");

        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(vec![
            entry(1, b"a", Some(b"old"), 3, 1),
            entry(1, b"b", Some(b"kept"), 3, 2),
            entry(2, b"c", Some(b"doomed"), 3, 3),
        ])
        .unwrap();
        tx.send(vec![
            entry(1, b"a", Some(b"new"), 4, 1),
            entry(2, b"c", None, 4, 2),
        ])
        .unwrap();
        drop(tx);

        let infos = run_reduce(0, &rx, &run_path, &StopControl::new())
            .unwrap()
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].storage_id, 1);
        assert_eq!(infos[0].entry_count, 2);

        let mut file = std::fs::File::open(&run_path).unwrap();
        assert_eq!(file.read_u32().unwrap(), 1);
        assert_eq!(file.read_bytes().unwrap(), b"a");
        assert_eq!(file.read_bytes().unwrap(), b"new");
        assert_eq!(file.read_u32().unwrap(), 1);
        assert_eq!(file.read_bytes().unwrap(), b"b");
        assert_eq!(file.read_bytes().unwrap(), b"kept");
        assert_eq!(file.read(&mut [0; 1]).unwrap(), 0);
    }

    #[test]
    fn cancellation_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let run_path = dir.path().join("run");

        let (tx, rx) = crossbeam_channel::unbounded::<super::ReducerBatch>();
        let stop = StopControl::new();
        stop.request_stop();
        assert!(run_reduce(0, &rx, &run_path, &stop).unwrap().is_none());
        drop(tx);
    }
}
