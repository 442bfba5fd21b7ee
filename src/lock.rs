use crossbeam_utils::Backoff;
use std::{
    num::NonZeroU32,
    ptr,
    sync::atomic::{
        AtomicBool, AtomicPtr,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
};

/// An opaque handle for one lock acquisition, valid against the pool that
/// produced it. Always non-zero, so an absent handle can be represented
/// compactly as `Option<McsBlockIndex>`.
pub type McsBlockIndex = NonZeroU32;

pub struct McsQnode {
    waiting: AtomicBool,
    successor: AtomicPtr<McsQnode>,
}

/// A fair FIFO queue lock colocated with each record's owner word.
///
/// The lock word is the queue tail. Waiters spin on their own queue node,
/// so handoff traffic stays within the waiting core's cache line.
pub struct McsLock {
    tail: AtomicPtr<McsQnode>,
}

impl McsLock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.tail.load(Acquire).is_null()
    }

    /// Joins the queue and spins until this acquisition reaches the head.
    ///
    /// The returned block stays owned by `pool` and must be passed back to
    /// [`release`] on the same pool.
    ///
    /// [`release`]: #method.release
    pub fn acquire(&self, pool: &mut McsBlockPool) -> McsBlockIndex {
        let block = pool.alloc();
        let node_ptr = pool.node_ptr(block);
        let prev = self.tail.swap(node_ptr, AcqRel);
        if !prev.is_null() {
            // SAFETY: the predecessor's node outlives its release, and
            // release does not return until this successor link is observed.
            unsafe { (*prev).successor.store(node_ptr, Release) };
            let backoff = Backoff::new();
            while unsafe { (*node_ptr).waiting.load(Acquire) } {
                backoff.snooze();
            }
        }
        block
    }

    /// Passes the lock to the next queued waiter, if any.
    pub fn release(&self, pool: &mut McsBlockPool, block: McsBlockIndex) {
        let node_ptr = pool.node_ptr(block);
        // SAFETY: `block` came from `pool` and has not been released yet.
        let node = unsafe { &*node_ptr };
        let mut successor = node.successor.load(Acquire);
        if successor.is_null() {
            let result = self
                .tail
                .compare_exchange(node_ptr, ptr::null_mut(), AcqRel, Acquire);
            if result.is_ok() {
                pool.free(block);
                return;
            }
            // A waiter has swapped the tail but has not linked itself yet.
            let backoff = Backoff::new();
            loop {
                successor = node.successor.load(Acquire);
                if !successor.is_null() {
                    break;
                }
                backoff.spin();
            }
        }
        // SAFETY: the successor is still spinning on its own node.
        unsafe { (*successor).waiting.store(false, Release) };
        pool.free(block);
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-worker pool of queue nodes.
///
/// Nodes are heap-pinned so their addresses stay stable while other workers
/// hold pointers to them through the queue; indices are recycled only after
/// the release handoff completes.
pub struct McsBlockPool {
    blocks: Vec<Box<McsQnode>>,
    free: Vec<McsBlockIndex>,
}

impl McsBlockPool {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self) -> McsBlockIndex {
        if let Some(block) = self.free.pop() {
            let node = &self.blocks[block.get() as usize - 1];
            node.waiting.store(true, Relaxed);
            node.successor.store(ptr::null_mut(), Relaxed);
            block
        } else {
            self.blocks.push(Box::new(McsQnode {
                waiting: AtomicBool::new(true),
                successor: AtomicPtr::new(ptr::null_mut()),
            }));
            NonZeroU32::new(self.blocks.len() as u32).unwrap()
        }
    }

    fn node_ptr(&self, block: McsBlockIndex) -> *mut McsQnode {
        let node: &McsQnode = &self.blocks[block.get() as usize - 1];
        node as *const McsQnode as *mut McsQnode
    }

    fn free(&mut self, block: McsBlockIndex) {
        self.free.push(block);
    }
}

impl Default for McsBlockPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{McsBlockPool, McsLock};
    use std::{cell::UnsafeCell, sync::Arc, time::Duration};

    #[test]
    fn lock_unlock() {
        let lock = McsLock::new();
        let mut pool = McsBlockPool::new();
        assert!(!lock.is_locked());
        let block = lock.acquire(&mut pool);
        assert!(lock.is_locked());
        lock.release(&mut pool, block);
        assert!(!lock.is_locked());
    }

    #[test]
    fn block_reuse() {
        let lock = McsLock::new();
        let mut pool = McsBlockPool::new();
        let first = lock.acquire(&mut pool);
        lock.release(&mut pool, first);
        let second = lock.acquire(&mut pool);
        assert_eq!(first, second);
        lock.release(&mut pool, second);
    }

    #[test]
    fn fifo_handoff() {
        let lock = Arc::new(McsLock::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut pool = McsBlockPool::new();
        let held = lock.acquire(&mut pool);

        let mut waiters = Vec::new();
        for id in 0..3 {
            let lock = lock.clone();
            let order = order.clone();
            waiters.push(std::thread::spawn(move || {
                let mut pool = McsBlockPool::new();
                let block = lock.acquire(&mut pool);
                order.lock().push(id);
                lock.release(&mut pool, block);
            }));
            // Give the waiter time to join the queue before the next one.
            std::thread::sleep(Duration::from_millis(50));
        }

        lock.release(&mut pool, held);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn mutual_exclusion() {
        struct Counter(UnsafeCell<u64>);
        unsafe impl Sync for Counter {}

        const THREADS: u64 = 4;
        const INCREMENTS: u64 = 1000;

        let lock = Arc::new(McsLock::new());
        let counter = Arc::new(Counter(UnsafeCell::new(0)));
        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    let mut pool = McsBlockPool::new();
                    for _ in 0..INCREMENTS {
                        let block = lock.acquire(&mut pool);
                        unsafe { *counter.0.get() += 1 };
                        lock.release(&mut pool, block);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(unsafe { *counter.0.get() }, THREADS * INCREMENTS);
    }
}
