use crate::{
    epoch::Epoch,
    lock::McsBlockIndex,
    storage::StorageId,
    xct_id::{OwnerId, XctId, MAX_ORDINAL},
};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering::SeqCst},
        Arc,
    },
};

/// A pointer to a record's owner word, shared across workers.
///
/// Storages keep owner words at stable addresses for the lifetime of the
/// engine; relocation never frees the old word, it only flags it as moved.
#[derive(Clone, Copy)]
pub struct OwnerPtr(NonNull<OwnerId>);

unsafe impl Send for OwnerPtr {}
unsafe impl Sync for OwnerPtr {}

impl OwnerPtr {
    pub fn new(owner: &OwnerId) -> Self {
        Self(NonNull::from(owner))
    }

    /// # Safety
    /// The caller picks the lifetime; the pointee must outlive it, which
    /// holds for owner words of live storages.
    pub unsafe fn as_ref<'a>(self) -> &'a OwnerId {
        self.0.as_ref()
    }

    /// The address, used as the lock-ordering sort key.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl PartialEq for OwnerPtr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for OwnerPtr {}

impl std::fmt::Debug for OwnerPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OwnerPtr").field(&self.0).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// No read-set tracking; observations may be torn across transactions.
    DirtyRead,
    /// Reads within the transaction come from a consistent past view.
    Snapshot,
    /// Full optimistic verification of every observation.
    Serializable,
}

/// One observed record: where its owner word lives and the id seen at
/// read time.
#[derive(Debug)]
pub struct ReadAccess {
    pub storage_id: StorageId,
    pub owner_id_address: OwnerPtr,
    pub observed_xct_id: XctId,
}

/// One record modification. `mcs_block` stays absent until the lock phase
/// acquires the record; several entries may share one owner address.
pub struct WriteAccess {
    pub storage_id: StorageId,
    pub owner_id_address: OwnerPtr,
    pub payload_address: *mut u8,
    pub(crate) log_offset: usize,
    pub(crate) mcs_block: Option<McsBlockIndex>,
}

/// A modification of an append-only storage; applied without locking.
pub struct LockFreeWriteAccess {
    pub storage_id: StorageId,
    pub(crate) log_offset: usize,
}

/// A pointer slot observed during the transaction.
#[derive(Debug)]
pub struct PointerAccess {
    pub address: NonNull<AtomicU64>,
    pub observed: u64,
}

/// A page header version observed during the transaction.
#[derive(Debug)]
pub struct PageVersionAccess {
    pub address: NonNull<AtomicU64>,
    pub observed: u64,
}

/// Passed through to storage apply hooks.
pub struct ApplyContext {
    pub worker_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XctState {
    Idle,
    Active,
}

/// Per-worker transaction state: the access sets and the worker's last
/// issued id. Buffers keep their allocations across transactions.
pub struct Xct {
    state: XctState,
    isolation: IsolationLevel,
    id: XctId,
    read_set: Vec<ReadAccess>,
    write_set: Vec<WriteAccess>,
    lock_free_write_set: Vec<LockFreeWriteAccess>,
    pointer_set: Vec<PointerAccess>,
    page_version_set: Vec<PageVersionAccess>,
}

impl Xct {
    pub(crate) fn new() -> Self {
        Self {
            state: XctState::Idle,
            isolation: IsolationLevel::Serializable,
            id: XctId::ZERO,
            read_set: Vec::new(),
            write_set: Vec::new(),
            lock_free_write_set: Vec::new(),
            pointer_set: Vec::new(),
            page_version_set: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == XctState::Active
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.lock_free_write_set.is_empty()
    }

    /// The id issued to this worker's most recent read-write commit.
    pub fn id(&self) -> XctId {
        self.id
    }

    pub(crate) fn activate(&mut self, isolation: IsolationLevel) {
        debug_assert_eq!(self.state, XctState::Idle);
        self.state = XctState::Active;
        self.isolation = isolation;
        self.read_set.clear();
        self.write_set.clear();
        self.lock_free_write_set.clear();
        self.pointer_set.clear();
        self.page_version_set.clear();
    }

    pub(crate) fn deactivate(&mut self) {
        debug_assert_eq!(self.state, XctState::Active);
        self.state = XctState::Idle;
    }

    pub fn read_set(&self) -> &[ReadAccess] {
        &self.read_set
    }

    pub fn write_set(&self) -> &[WriteAccess] {
        &self.write_set
    }

    pub fn lock_free_write_set(&self) -> &[LockFreeWriteAccess] {
        &self.lock_free_write_set
    }

    pub(crate) fn read_set_mut(&mut self) -> &mut [ReadAccess] {
        &mut self.read_set
    }

    pub(crate) fn write_set_mut(&mut self) -> &mut Vec<WriteAccess> {
        &mut self.write_set
    }

    pub(crate) fn sets_for_apply(
        &mut self,
    ) -> (&mut Vec<WriteAccess>, &[LockFreeWriteAccess]) {
        (&mut self.write_set, &self.lock_free_write_set)
    }

    pub(crate) fn pointer_set(&self) -> &[PointerAccess] {
        &self.pointer_set
    }

    pub(crate) fn page_version_set(&self) -> &[PageVersionAccess] {
        &self.page_version_set
    }

    pub(crate) fn add_to_read_set(&mut self, access: ReadAccess) {
        self.read_set.push(access);
    }

    pub(crate) fn add_to_write_set(&mut self, access: WriteAccess) {
        self.write_set.push(access);
    }

    pub(crate) fn add_to_lock_free_write_set(&mut self, access: LockFreeWriteAccess) {
        self.lock_free_write_set.push(access);
    }

    pub(crate) fn add_to_pointer_set(&mut self, access: PointerAccess) {
        self.pointer_set.push(access);
    }

    pub(crate) fn add_to_page_version_set(&mut self, access: PageVersionAccess) {
        self.page_version_set.push(access);
    }

    /// Issues the id for a committing transaction. The new id is later than
    /// this worker's previous id and later than every id the transaction
    /// observed, and it lives in the commit epoch.
    pub(crate) fn issue_next_id(&mut self, max_xct_id: XctId, commit_epoch: Epoch) -> XctId {
        let mut base = self.id;
        base.store_max(max_xct_id);
        let ordinal = if base.is_valid() && base.epoch() == commit_epoch {
            debug_assert!(!commit_epoch.before(base.epoch()));
            base.ordinal() + 1
        } else {
            debug_assert!(!base.is_valid() || base.epoch().before(commit_epoch));
            1
        };
        // 24 bits of ordinals per worker per epoch; epochs last milliseconds.
        debug_assert!(ordinal <= MAX_ORDINAL);
        let new_id = XctId::new(commit_epoch, ordinal);
        self.id = new_id;
        new_id
    }
}

/// Worker state shared with the log subsystem.
pub(crate) struct WorkerSharedState {
    /// The epoch a mid-commit transaction is serializing at, or invalid.
    /// Loggers refuse to declare an epoch durable past any value here.
    pub in_commit_epoch: CachePadded<AtomicU32>,
}

impl WorkerSharedState {
    pub fn new() -> Self {
        Self {
            in_commit_epoch: CachePadded::new(AtomicU32::new(Epoch::INVALID.0)),
        }
    }
}

/// All workers ever spawned on the engine; scanned by the durable-epoch
/// calculation.
pub(crate) struct WorkerRegistry {
    states: Mutex<Vec<Arc<WorkerSharedState>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self) -> Arc<WorkerSharedState> {
        let state = Arc::new(WorkerSharedState::new());
        self.states.lock().push(state.clone());
        state
    }

    /// The earliest epoch any worker is currently committing at.
    pub fn min_in_commit_epoch(&self) -> Option<Epoch> {
        let states = self.states.lock();
        let mut min: Option<Epoch> = None;
        for state in states.iter() {
            let epoch = Epoch(state.in_commit_epoch.load(SeqCst));
            if !epoch.is_valid() {
                continue;
            }
            if min.map_or(true, |min| epoch.before(min)) {
                min = Some(epoch);
            }
        }
        min
    }
}

/// Marks the owning worker as mid-commit at `epoch` for the duration of
/// the scope. Installed before the serialization point and cleared after
/// log publication.
pub(crate) struct InCommitEpochGuard<'a> {
    slot: &'a AtomicU32,
}

impl<'a> InCommitEpochGuard<'a> {
    pub fn new(state: &'a WorkerSharedState, epoch: Epoch) -> Self {
        state.in_commit_epoch.store(epoch.0, SeqCst);
        Self {
            slot: &state.in_commit_epoch,
        }
    }
}

impl Drop for InCommitEpochGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(Epoch::INVALID.0, SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::{InCommitEpochGuard, IsolationLevel, WorkerRegistry, Xct};
    use crate::{epoch::Epoch, xct_id::XctId};

    #[test]
    fn lifecycle() {
        let mut xct = Xct::new();
        assert!(!xct.is_active());
        xct.activate(IsolationLevel::Serializable);
        assert!(xct.is_active());
        assert!(xct.is_read_only());
        xct.deactivate();
        assert!(!xct.is_active());
    }

    #[test]
    fn issue_next_id_rebases_to_commit_epoch() {
        let mut xct = Xct::new();
        let first = xct.issue_next_id(XctId::ZERO, Epoch(3));
        assert_eq!(first, XctId::new(Epoch(3), 1));

        // Same epoch: the worker's own ordinal advances.
        let second = xct.issue_next_id(XctId::ZERO, Epoch(3));
        assert_eq!(second, XctId::new(Epoch(3), 2));

        // Observed ids push the ordinal past them.
        let third = xct.issue_next_id(XctId::new(Epoch(3), 9), Epoch(3));
        assert_eq!(third, XctId::new(Epoch(3), 10));

        // A later epoch resets the ordinal.
        let fourth = xct.issue_next_id(XctId::ZERO, Epoch(5));
        assert_eq!(fourth, XctId::new(Epoch(5), 1));
    }

    #[test]
    fn in_commit_epoch_guard() {
        let registry = WorkerRegistry::new();
        let state = registry.register();
        assert_eq!(registry.min_in_commit_epoch(), None);
        {
            let _guard = InCommitEpochGuard::new(&state, Epoch(7));
            assert_eq!(registry.min_in_commit_epoch(), Some(Epoch(7)));

            let other = registry.register();
            let _other_guard = InCommitEpochGuard::new(&other, Epoch(5));
            assert_eq!(registry.min_in_commit_epoch(), Some(Epoch(5)));
        }
        assert_eq!(registry.min_in_commit_epoch(), None);
    }
}
