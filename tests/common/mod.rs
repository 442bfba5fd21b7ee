//! A minimal slot-array storage used to drive the engine from the outside,
//! the way a real storage data structure would.

// Each test binary uses a different subset of this fixture.
#![allow(dead_code)]

use kura::{
    ApplyContext, Error, LogKind, LogRecordView, OwnerId, OwnerPtr, Partitioner, Result, Storage,
    StorageId, Worker, WriteAccess, XctId,
};
use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

pub const PAYLOAD_LEN: usize = 16;

/// Marks a moved record whose new home is unreachable.
const FORWARD_LOST: usize = usize::MAX;

struct Slot {
    owner: OwnerId,
    payload: UnsafeCell<[u8; PAYLOAD_LEN]>,
    /// Index + 1 of the slot this record forwarded to; 0 when in place.
    forward: AtomicUsize,
}

/// A fixed-capacity record array. Payload cells are only mutated through
/// the engine's apply hook, with the record lock held and the owner word
/// flagged as mid-write.
pub struct TableStorage {
    id: StorageId,
    name: String,
    slots: Box<[Slot]>,
    partitioner_fails: AtomicBool,
}

unsafe impl Sync for TableStorage {}

impl TableStorage {
    pub fn new(id: StorageId, name: &str, capacity: usize) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Slot {
                owner: OwnerId::new(XctId::ZERO),
                payload: UnsafeCell::new([0; PAYLOAD_LEN]),
                forward: AtomicUsize::new(0),
            })
            .collect();
        Arc::new(Self {
            id,
            name: name.to_owned(),
            slots,
            partitioner_fails: AtomicBool::new(false),
        })
    }

    pub fn fail_partitioner(&self) {
        self.partitioner_fails.store(true, SeqCst);
    }

    /// Test setup: installs a record outside any transaction.
    pub fn seed(&self, slot: usize, xct_id: XctId, payload: &[u8; PAYLOAD_LEN]) {
        let target = &self.slots[slot];
        unsafe { *target.payload.get() = *payload };
        target.owner.publish(xct_id);
    }

    pub fn owner(&self, slot: usize) -> &OwnerId {
        &self.slots[slot].owner
    }

    /// Test observation: reads the payload outside any transaction.
    pub fn payload(&self, slot: usize) -> [u8; PAYLOAD_LEN] {
        unsafe { *self.slots[slot].payload.get() }
    }

    /// Relocates a record: the target slot becomes the new home and the
    /// source keeps a forwarding pointer with its moved flag set.
    pub fn relocate(&self, from: usize, to: usize) {
        let source = &self.slots[from];
        let target = &self.slots[to];
        unsafe { *target.payload.get() = *source.payload.get() };
        target.owner.publish(source.owner.xct_id());
        source.forward.store(to + 1, SeqCst);
        source.owner.mark_moved();
    }

    /// Poisons a record as moved-beyond-reach.
    pub fn relocate_lost(&self, from: usize) {
        self.slots[from].forward.store(FORWARD_LOST, SeqCst);
        self.slots[from].owner.mark_moved();
    }

    /// A transactional read: optimistic payload snapshot validated by the
    /// owner word, recorded in the worker's read set.
    pub fn get(&self, worker: &mut Worker<'_>, slot: usize) -> Result<[u8; PAYLOAD_LEN]> {
        let target = &self.slots[slot];
        loop {
            let before = target.owner.xct_id();
            if before.is_being_written() {
                std::hint::spin_loop();
                continue;
            }
            let payload = unsafe { *target.payload.get() };
            if target.owner.xct_id() == before {
                worker.add_to_read_set(self.id, OwnerPtr::new(&target.owner), before)?;
                return Ok(payload);
            }
        }
    }

    /// A transactional overwrite, staged in the worker's write set.
    pub fn put(&self, worker: &mut Worker<'_>, slot: usize, payload: &[u8]) -> Result<()> {
        let target = &self.slots[slot];
        worker.add_to_write_set(
            self.id,
            OwnerPtr::new(&target.owner),
            target.payload.get().cast(),
            LogKind::RecordUpsert,
            &key_of(slot),
            payload,
        )
    }

    /// A transactional delete.
    pub fn delete(&self, worker: &mut Worker<'_>, slot: usize) -> Result<()> {
        let target = &self.slots[slot];
        worker.add_to_write_set(
            self.id,
            OwnerPtr::new(&target.owner),
            target.payload.get().cast(),
            LogKind::RecordDelete,
            &key_of(slot),
            &[],
        )
    }

    fn slot_index_of(&self, owner_addr: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| &slot.owner as *const OwnerId as usize == owner_addr)
    }
}

impl Storage for TableStorage {
    fn id(&self) -> StorageId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn track_moved_record(&self, write: &mut WriteAccess) -> bool {
        let Some(index) = self.slot_index_of(write.owner_id_address.addr()) else {
            return false;
        };
        let forward = self.slots[index].forward.load(SeqCst);
        if forward == 0 || forward == FORWARD_LOST {
            return false;
        }
        let target = &self.slots[forward - 1];
        write.owner_id_address = OwnerPtr::new(&target.owner);
        write.payload_address = target.payload.get().cast();
        true
    }

    fn track_moved_owner(&self, owner: OwnerPtr) -> OwnerPtr {
        let mut index = match self.slot_index_of(owner.addr()) {
            Some(index) => index,
            None => return owner,
        };
        loop {
            let forward = self.slots[index].forward.load(SeqCst);
            if forward == 0 || forward == FORWARD_LOST {
                return OwnerPtr::new(&self.slots[index].owner);
            }
            index = forward - 1;
        }
    }

    fn apply_record(
        &self,
        _context: &mut ApplyContext,
        log: &LogRecordView<'_>,
        owner: Option<&OwnerId>,
        payload: Option<NonNull<u8>>,
    ) {
        match log.kind {
            LogKind::RecordUpsert => {
                let owner = owner.expect("record writes are locked");
                let payload = payload.expect("record writes carry a payload cell");
                assert!(log.payload.len() <= PAYLOAD_LEN);
                unsafe {
                    let cell = payload.as_ptr();
                    std::ptr::write_bytes(cell, 0, PAYLOAD_LEN);
                    std::ptr::copy_nonoverlapping(log.payload.as_ptr(), cell, log.payload.len());
                }
                owner.clear_deleted();
            }
            LogKind::RecordDelete => {
                owner.expect("record writes are locked").set_deleted();
            }
            _ => {}
        }
    }

    fn make_partitioner(&self, num_nodes: usize) -> Result<Arc<dyn Partitioner>> {
        if self.partitioner_fails.load(SeqCst) {
            return Err(Error::GleanerWorkerFailed);
        }
        Ok(Arc::new(SlotPartitioner { num_nodes }))
    }
}

struct SlotPartitioner {
    num_nodes: usize,
}

impl Partitioner for SlotPartitioner {
    fn node_of(&self, key: &[u8]) -> usize {
        let sum: usize = key.iter().map(|byte| *byte as usize).sum();
        sum % self.num_nodes
    }
}

pub fn key_of(slot: usize) -> [u8; 8] {
    (slot as u64).to_be_bytes()
}

/// A fixed-width payload from a short literal.
pub fn val(bytes: &[u8]) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0; PAYLOAD_LEN];
    payload[..bytes.len()].copy_from_slice(bytes);
    payload
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
