use crate::{epoch::Epoch, lock::McsLock};
use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

// XctId format:
// bits[63:32] - epoch
// bits[31:8]  - ordinal (distinguishes commits by one worker within an epoch)
// bits[7:0]   - status flags
const EPOCH_SHIFT: u32 = 32;
const ORDINAL_SHIFT: u32 = 8;
const ORDINAL_MASK: u64 = (1 << (EPOCH_SHIFT - ORDINAL_SHIFT)) - 1;
const STATUS_MASK: u64 = (1 << ORDINAL_SHIFT) - 1;

const BEING_WRITTEN: u64 = 0x1;
const DELETED: u64 = 0x2;
const MOVED: u64 = 0x4;

/// The largest ordinal a single worker can issue within one epoch.
pub const MAX_ORDINAL: u32 = ORDINAL_MASK as u32;

/// Identifies a committed transaction's effect on a record:
/// `(epoch, ordinal)` plus record status flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct XctId(pub u64);

impl XctId {
    pub const ZERO: Self = Self(0);

    pub const fn new(epoch: Epoch, ordinal: u32) -> Self {
        Self(((epoch.0 as u64) << EPOCH_SHIFT) | ((ordinal as u64) << ORDINAL_SHIFT))
    }

    pub const fn epoch(self) -> Epoch {
        Epoch((self.0 >> EPOCH_SHIFT) as u32)
    }

    pub const fn ordinal(self) -> u32 {
        ((self.0 >> ORDINAL_SHIFT) & ORDINAL_MASK) as u32
    }

    pub const fn is_valid(self) -> bool {
        self.epoch().is_valid()
    }

    pub const fn is_being_written(self) -> bool {
        self.0 & BEING_WRITTEN != 0
    }

    pub const fn is_deleted(self) -> bool {
        self.0 & DELETED != 0
    }

    pub const fn is_moved(self) -> bool {
        self.0 & MOVED != 0
    }

    pub const fn with_deleted(self) -> Self {
        Self(self.0 | DELETED)
    }

    pub const fn without_status(self) -> Self {
        Self(self.0 & !STATUS_MASK)
    }

    /// Lexicographic order on `(epoch, ordinal)`, wrap-aware on the epoch.
    /// Status flags do not participate.
    pub fn before(self, other: Self) -> bool {
        if self.epoch() == other.epoch() {
            self.ordinal() < other.ordinal()
        } else {
            self.epoch().before(other.epoch())
        }
    }

    /// Merges `other` into the running maximum, ignoring status flags.
    pub fn store_max(&mut self, other: Self) {
        let other = other.without_status();
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }
}

impl std::fmt::Debug for XctId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XctId")
            .field("epoch", &self.epoch().0)
            .field("ordinal", &self.ordinal())
            .field("being_written", &self.is_being_written())
            .field("deleted", &self.is_deleted())
            .field("moved", &self.is_moved())
            .finish()
    }
}

/// The owner word colocated with each record: the record's queue lock plus
/// the [`XctId`] of the transaction that last committed the record.
///
/// The store that releases the record publishes the new id together with
/// the cleared being-written flag; every gating observation is an acquire
/// load.
pub struct OwnerId {
    lock: McsLock,
    xct_id: AtomicU64,
}

impl OwnerId {
    pub fn new(id: XctId) -> Self {
        Self {
            lock: McsLock::new(),
            xct_id: AtomicU64::new(id.0),
        }
    }

    pub fn lock(&self) -> &McsLock {
        &self.lock
    }

    pub fn xct_id(&self) -> XctId {
        XctId(self.xct_id.load(Acquire))
    }

    pub fn is_keylocked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_moved(&self) -> bool {
        self.xct_id().is_moved()
    }

    /// Publishes a new id, clearing the being-written flag as a side effect
    /// of the store. Callers must have exclusive write access to the
    /// record: the lock holder, or setup code before the record is shared.
    pub fn publish(&self, id: XctId) {
        debug_assert!(!id.is_being_written());
        self.xct_id.store(id.0, Release);
    }

    /// Marks the record as logically relocated. The bit is never cleared;
    /// the record's new home carries a fresh owner word. Callers must have
    /// exclusive write access to the record.
    pub fn mark_moved(&self) {
        let id = self.xct_id.load(Relaxed);
        self.xct_id.store(id | MOVED, Release);
    }

    /// Flags the record as mid-write before its payload is mutated.
    /// Requires the lock to be held.
    pub(crate) fn set_being_written(&self) {
        let id = self.xct_id.load(Relaxed);
        self.xct_id.store(id | BEING_WRITTEN, Release);
    }

    /// Sets the deleted flag. Called by storage apply hooks for delete
    /// operations while the record is locked and mid-write; the final
    /// publication preserves the flag.
    pub fn set_deleted(&self) {
        let id = self.xct_id.load(Relaxed);
        self.xct_id.store(id | DELETED, Relaxed);
    }

    /// Clears the deleted flag, for apply hooks that overwrite a
    /// previously deleted record. Requires the lock to be held.
    pub fn clear_deleted(&self) {
        let id = self.xct_id.load(Relaxed);
        self.xct_id.store(id & !DELETED, Relaxed);
    }
}
