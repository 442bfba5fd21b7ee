use crate::{
    access::{ApplyContext, InCommitEpochGuard, WorkerSharedState, WriteAccess, Xct},
    epoch::{Epoch, EpochFramework},
    lock::McsBlockPool,
    log::ThreadLogBuffer,
    log_manager::{LogChannel, LogManager},
    storage::{Storage, StorageManager},
    xct_id::XctId,
    Error, Result,
};
use std::{
    ptr::NonNull,
    sync::{
        atomic::{fence, Ordering::AcqRel, Ordering::Acquire, Ordering::Release},
        Arc,
    },
};
use tracing::debug;

/// Everything a worker lends to the commit protocol for one precommit.
pub(crate) struct CommitContext<'a> {
    pub worker_id: usize,
    pub xct: &'a mut Xct,
    pub log_buffer: &'a mut ThreadLogBuffer,
    pub mcs_pool: &'a mut McsBlockPool,
    pub shared: &'a WorkerSharedState,
    pub channel: &'a LogChannel,
    pub epoch_fw: &'a EpochFramework,
    pub log_manager: &'a LogManager,
    pub storages: &'a StorageManager,
}

const READ_SET_PREFETCH_BATCH: usize = 16;

pub(crate) fn precommit_xct(ctx: &mut CommitContext<'_>) -> Result<Epoch> {
    if ctx.xct.is_read_only() {
        precommit_readonly(ctx)
    } else {
        precommit_readwrite(ctx)
    }
}

#[inline]
fn prefetch_owner(owner: crate::access::OwnerPtr) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(owner.addr() as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = owner;
}

fn storage_of(storages: &StorageManager, id: crate::storage::StorageId) -> Arc<dyn Storage> {
    storages
        .get(id)
        .expect("access sets reference registered storages")
}

fn precommit_readonly(ctx: &mut CommitContext<'_>) -> Result<Epoch> {
    debug_assert_eq!(
        ctx.log_buffer.offset_committed(),
        ctx.log_buffer.offset_tail()
    );
    fence(Acquire);

    let mut commit_epoch = Epoch::INVALID;
    let read_set = ctx.xct.read_set_mut();
    for i in 0..read_set.len() {
        if i % READ_SET_PREFETCH_BATCH == 0 {
            let batch_end = read_set.len().min(i + READ_SET_PREFETCH_BATCH);
            for access in &read_set[i..batch_end] {
                prefetch_owner(access.owner_id_address);
            }
        }
        let access = &mut read_set[i];
        if unsafe { access.owner_id_address.as_ref() }.is_moved() {
            let storage = storage_of(ctx.storages, access.storage_id);
            access.owner_id_address = storage.track_moved_owner(access.owner_id_address);
        }
        let current = unsafe { access.owner_id_address.as_ref() }.xct_id();
        if access.observed_xct_id != current {
            debug!("read set changed by another transaction; aborting");
            return Err(Error::RaceAbort);
        }
        commit_epoch.store_max(access.observed_xct_id.epoch());
    }

    // A transaction that observed nothing can be considered committed as
    // of any already-durable epoch.
    if !commit_epoch.is_valid() {
        commit_epoch = ctx.log_manager.durable_global_epoch_weak();
    }

    if !verify_pointer_set(ctx.xct) || !verify_page_version_set(ctx.xct) {
        return Err(Error::RaceAbort);
    }
    Ok(commit_epoch)
}

fn precommit_readwrite(ctx: &mut CommitContext<'_>) -> Result<Epoch> {
    let mut max_xct_id = XctId::ZERO;
    if !precommit_lock(ctx, &mut max_xct_id) {
        debug!("a write-set record moved too far away; aborting");
        return Err(Error::RaceAbort);
    }

    // The guard goes up before the first fence so loggers never close the
    // epoch this commit is about to serialize in.
    let guard = InCommitEpochGuard::new(ctx.shared, ctx.epoch_fw.current_global_epoch_weak());

    fence(AcqRel);
    let commit_epoch = ctx.epoch_fw.current_global_epoch_weak(); // serialization point
    fence(AcqRel);

    let verified = precommit_verify_readwrite(ctx, &mut max_xct_id);
    #[cfg(debug_assertions)]
    for write in ctx.xct.write_set() {
        debug_assert!(unsafe { write.owner_id_address.as_ref() }.is_keylocked());
    }

    if !verified {
        let xct = &mut *ctx.xct;
        unlock_write_set(xct.write_set_mut(), ctx.mcs_pool);
        drop(guard);
        return Err(Error::RaceAbort);
    }

    precommit_apply(ctx, max_xct_id, commit_epoch);

    // The logs carry the assigned xct id after apply; publish them only
    // behind a fence.
    fence(Release);
    let channel = ctx.channel;
    ctx.log_buffer
        .publish_committed_log(|bytes| channel.publish(bytes, commit_epoch));
    ctx.log_manager.wakeup_loggers();
    drop(guard);

    Ok(commit_epoch)
}

/// Phase 1: sort the write set by owner address and lock every distinct
/// record, retrying from scratch whenever a record turns out to have moved.
///
/// Tracking happens before locking; lock-then-track could deadlock against
/// the storage's own relocation locking.
fn precommit_lock(ctx: &mut CommitContext<'_>, max_xct_id: &mut XctId) -> bool {
    let xct = &mut *ctx.xct;
    // The owner words are about to be read and locked; warm them up.
    for write in xct.write_set() {
        prefetch_owner(write.owner_id_address);
    }
    'retry: loop {
        let write_set = xct.write_set_mut();
        for write in write_set.iter_mut() {
            debug_assert!(write.mcs_block.is_none());
            if unsafe { write.owner_id_address.as_ref() }.is_moved() {
                let storage = storage_of(ctx.storages, write.storage_id);
                if !storage.track_moved_record(write) {
                    // The record went too far away, typically into another
                    // layer of the structure. Retrying the whole
                    // transaction is the only option. Rare.
                    return false;
                }
            }
        }

        // Stable, so duplicate writes to one record keep program order.
        write_set.sort_by_key(|write| write.owner_id_address.addr());

        for i in 0..write_set.len() {
            let same_as_next = i + 1 < write_set.len()
                && write_set[i].owner_id_address == write_set[i + 1].owner_id_address;
            if same_as_next {
                // Lock and unlock only at the last write set of the record.
                continue;
            }
            let owner_ptr = write_set[i].owner_id_address;
            let owner = unsafe { owner_ptr.as_ref() };
            let block = owner.lock().acquire(ctx.mcs_pool);
            write_set[i].mcs_block = Some(block);
            if owner.is_moved() {
                // The record moved between tracking and locking. This
                // occasionally happens; release and start over.
                debug!("moved-bit conflict while locking; retrying the lock phase");
                unlock_write_set(write_set, ctx.mcs_pool);
                continue 'retry;
            }
            debug_assert!(owner.is_keylocked());
            max_xct_id.store_max(owner.xct_id());
        }
        return true;
    }
}

/// Phase 2: every observation must still hold.
fn precommit_verify_readwrite(ctx: &mut CommitContext<'_>, max_xct_id: &mut XctId) -> bool {
    let read_set = ctx.xct.read_set_mut();
    for i in 0..read_set.len() {
        if i % READ_SET_PREFETCH_BATCH == 0 {
            let batch_end = read_set.len().min(i + READ_SET_PREFETCH_BATCH);
            for access in &read_set[i..batch_end] {
                prefetch_owner(access.owner_id_address);
            }
        }
        let access = &mut read_set[i];
        // Unlike write-set locking there is no retry loop here. If yet
        // another relocation races us, the id comparison fails and the
        // transaction aborts.
        if unsafe { access.owner_id_address.as_ref() }.is_moved() {
            let storage = storage_of(ctx.storages, access.storage_id);
            access.owner_id_address = storage.track_moved_owner(access.owner_id_address);
        }
        let current = unsafe { access.owner_id_address.as_ref() }.xct_id();
        if access.observed_xct_id != current {
            debug!("read set changed by another transaction; aborting");
            return false;
        }
        max_xct_id.store_max(access.observed_xct_id);
    }
    verify_pointer_set(ctx.xct) && verify_page_version_set(ctx.xct)
}

fn verify_pointer_set(xct: &Xct) -> bool {
    for access in xct.pointer_set() {
        let current = unsafe { access.address.as_ref() }.load(Acquire);
        if current != access.observed {
            debug!("a pointer slot changed by another transaction; aborting");
            return false;
        }
    }
    true
}

fn verify_page_version_set(xct: &Xct) -> bool {
    for access in xct.page_version_set() {
        let current = unsafe { access.address.as_ref() }.load(Acquire);
        if current != access.observed {
            debug!("a page version changed by another transaction; aborting");
            return false;
        }
    }
    true
}

/// Phase 3: stamp the new id onto every log record, let the storages
/// mutate payloads, and publish the owner words while releasing the locks.
fn precommit_apply(ctx: &mut CommitContext<'_>, max_xct_id: XctId, commit_epoch: Epoch) {
    let new_xct_id = ctx.xct.issue_next_id(max_xct_id, commit_epoch);
    debug_assert_eq!(new_xct_id.epoch(), commit_epoch);
    debug_assert!(new_xct_id.ordinal() > 0);
    // Used when the record ends up in the deleted state after apply.
    let new_deleted_xct_id = new_xct_id.with_deleted();

    let mut apply_context = ApplyContext {
        worker_id: ctx.worker_id,
    };

    let (write_set, lock_free_write_set) = ctx.xct.sets_for_apply();
    for i in 0..write_set.len() {
        let same_as_prev =
            i > 0 && write_set[i].owner_id_address == write_set[i - 1].owner_id_address;
        let same_as_next = i + 1 < write_set.len()
            && write_set[i].owner_id_address == write_set[i + 1].owner_id_address;
        let (owner_ptr, log_offset, storage_id) = {
            let write = &write_set[i];
            (write.owner_id_address, write.log_offset, write.storage_id)
        };
        let owner = unsafe { owner_ptr.as_ref() };
        debug_assert!(owner.is_keylocked());

        ctx.log_buffer.stamp_xct_id(log_offset, new_xct_id);

        if same_as_prev {
            // The previous entry of the run already staged the write and
            // kept the lock.
            debug_assert!(owner.xct_id().is_being_written());
        } else {
            debug_assert!(!owner.xct_id().is_being_written());
            owner.set_being_written();
            fence(Release);
        }

        {
            let view = ctx.log_buffer.record_at(log_offset);
            let storage = storage_of(ctx.storages, storage_id);
            storage.apply_record(
                &mut apply_context,
                &view,
                Some(owner),
                NonNull::new(write_set[i].payload_address),
            );
        }
        debug_assert!(
            !owner.xct_id().is_valid() || owner.xct_id().without_status().before(new_xct_id)
        );

        if same_as_next {
            // Keep the lock for the rest of the run.
            debug_assert!(write_set[i].mcs_block.is_none());
        } else {
            // The payload write must be visible before the owner word
            // publishes it, and the owner word before the lock handoff.
            fence(Release);
            let final_id = if owner.xct_id().is_deleted() {
                new_deleted_xct_id
            } else {
                new_xct_id
            };
            owner.publish(final_id);
            let block = write_set[i]
                .mcs_block
                .take()
                .expect("the last entry of a run holds the lock");
            owner.lock().release(ctx.mcs_pool, block);
        }
    }

    // Lock-free writes have no lock and no ordering beyond log order.
    for write in lock_free_write_set {
        ctx.log_buffer.stamp_xct_id(write.log_offset, new_xct_id);
        let view = ctx.log_buffer.record_at(write.log_offset);
        let storage = storage_of(ctx.storages, write.storage_id);
        storage.apply_record(&mut apply_context, &view, None, None);
    }
}

/// Releases whatever locks are currently held, without applying.
/// Also used halfway through the lock phase, where only a prefix is held.
pub(crate) fn unlock_write_set(write_set: &mut [WriteAccess], pool: &mut McsBlockPool) {
    fence(Release);
    for write in write_set.iter_mut() {
        if let Some(block) = write.mcs_block.take() {
            let owner = unsafe { write.owner_id_address.as_ref() };
            debug_assert!(owner.is_keylocked());
            owner.lock().release(pool, block);
        }
    }
    fence(Release);
}
