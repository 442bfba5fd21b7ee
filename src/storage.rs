use crate::{
    access::{ApplyContext, OwnerPtr, WriteAccess},
    log::LogRecordView,
    xct_id::OwnerId,
    Result,
};
use scc::HashIndex;
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering::SeqCst},
        Arc,
    },
};

pub type StorageId = u32;

/// Routes a record key to the NUMA node that owns it in a snapshot.
pub trait Partitioner: Send + Sync {
    fn node_of(&self, key: &[u8]) -> usize;
}

/// The contract between the transaction core and a storage data structure.
///
/// The core never inspects pages or records itself; it dispatches through
/// this trait for relocation tracking, log application, and snapshot
/// partitioning.
pub trait Storage: Send + Sync {
    fn id(&self) -> StorageId;

    /// Diagnostics only.
    fn name(&self) -> &str;

    /// Rewrites the access to point at the record's new home after a
    /// relocation. Returns false when the record has drifted out of reach
    /// and the whole transaction must retry.
    fn track_moved_record(&self, write: &mut WriteAccess) -> bool;

    /// Resolves a relocated owner word to its current address.
    fn track_moved_owner(&self, owner: OwnerPtr) -> OwnerPtr;

    /// Applies one record log to the record. The owner word stays locked
    /// and flagged as mid-write across the call. For lock-free entries both
    /// the owner word and the payload address are absent.
    fn apply_record(
        &self,
        context: &mut ApplyContext,
        log: &LogRecordView<'_>,
        owner: Option<&OwnerId>,
        payload: Option<NonNull<u8>>,
    );

    /// Builds the partitioner used when gleaning this storage into a
    /// snapshot.
    fn make_partitioner(&self, num_nodes: usize) -> Result<Arc<dyn Partitioner>>;
}

/// Side table from [`StorageId`] to the storage behind it. Reads on the
/// commit hot path are lock-free.
pub struct StorageManager {
    storages: HashIndex<StorageId, Arc<dyn Storage>>,
    largest_storage_id: AtomicU32,
}

impl StorageManager {
    pub(crate) fn new() -> Self {
        Self {
            storages: HashIndex::new(),
            largest_storage_id: AtomicU32::new(0),
        }
    }

    pub fn register(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let id = storage.id();
        self.storages
            .insert(id, storage)
            .map_err(|_| crate::Error::StorageExists(id))?;
        self.largest_storage_id.fetch_max(id, SeqCst);
        Ok(())
    }

    pub fn deregister(&self, id: StorageId) -> Result<()> {
        if self.storages.remove(&id) {
            Ok(())
        } else {
            Err(crate::Error::StorageNotFound(id))
        }
    }

    pub fn get(&self, id: StorageId) -> Option<Arc<dyn Storage>> {
        self.storages.peek_with(&id, |_, storage| storage.clone())
    }

    /// Diagnostics-friendly name lookup.
    pub fn get_name(&self, id: StorageId) -> String {
        self.storages
            .peek_with(&id, |_, storage| storage.name().to_owned())
            .unwrap_or_else(|| format!("<unknown storage {id}>"))
    }

    /// The largest id ever registered, including since-dropped storages.
    pub fn largest_storage_id(&self) -> StorageId {
        self.largest_storage_id.load(SeqCst)
    }

    /// Lists the currently registered storages, sorted by id.
    pub fn list(&self) -> Vec<Arc<dyn Storage>> {
        let guard = scc::ebr::Guard::new();
        let mut storages: Vec<_> = self
            .storages
            .iter(&guard)
            .map(|(_, storage)| storage.clone())
            .collect();
        storages.sort_unstable_by_key(|storage| storage.id());
        storages
    }
}
