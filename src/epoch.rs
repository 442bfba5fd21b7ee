// Epoch-based group commit and serialization is described in:
// Tu et al. 2013. Speedy transactions in multicore in-memory databases. https://doi.org/10.1145/2517349.2522713

use crate::stoppable::{StopControl, Wakeup};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicU32, Ordering::Relaxed, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, info};

/// A coarse unit of logical time used as the serialization timestamp.
///
/// Epochs are 32-bit wrapping counters. Zero is the distinguished invalid
/// value and is never revisited by [`one_more`]; comparisons are wrap-aware
/// over the half range, so the live window of epochs is totally ordered.
///
/// [`one_more`]: #method.one_more
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const INVALID: Self = Self(0);

    /// The epoch that is already durable when a brand-new engine starts.
    pub const INITIAL_DURABLE: Self = Self(1);

    /// The first epoch that becomes current in a brand-new engine.
    pub const INITIAL_CURRENT: Self = Self(2);

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the successor epoch, wrapping around the 32-bit space
    /// without revisiting the invalid value.
    pub const fn one_more(self) -> Self {
        let next = self.0.wrapping_add(1);
        if next == Self::INVALID.0 {
            Self(1)
        } else {
            Self(next)
        }
    }

    /// Returns the predecessor epoch. The result of decrementing the
    /// initial durable epoch saturates to it.
    pub const fn one_less(self) -> Self {
        if self.0 <= Self::INITIAL_DURABLE.0 {
            Self::INITIAL_DURABLE
        } else {
            Self(self.0 - 1)
        }
    }

    pub fn before(self, other: Self) -> bool {
        matches!(self.partial_cmp(&other), Some(Ordering::Less))
    }

    /// Replaces `self` with `other` if `other` is a later valid epoch.
    pub fn store_max(&mut self, other: Self) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }
}

impl PartialOrd for Epoch {
    /// Wrap-aware comparison over the half range. Invalid epochs are
    /// unordered against everything.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        let distance = other.0.wrapping_sub(self.0);
        if distance < 1 << 31 {
            Some(Ordering::Less)
        } else {
            Some(Ordering::Greater)
        }
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SharedState {
    current_global_epoch: CachePadded<AtomicU32>,
    /// Signaled to hurry the advancer along; also carries its stop request.
    advance_wakeup: StopControl,
    /// Broadcast target for every epoch bump.
    advanced_mutex: Mutex<()>,
    advanced_condvar: Condvar,
    /// Loggers sleep on this; the advancer wakes them after each bump.
    logger_wakeup: Arc<StopControl>,
}

/// Owns the global epoch and the single thread that advances it.
pub struct EpochFramework {
    shared: Arc<SharedState>,
    advancer: Mutex<Option<JoinHandle<()>>>,
}

impl EpochFramework {
    pub fn new(advance_interval: Duration, logger_wakeup: Arc<StopControl>) -> Self {
        let shared = Arc::new(SharedState {
            current_global_epoch: CachePadded::new(AtomicU32::new(Epoch::INITIAL_CURRENT.0)),
            advance_wakeup: StopControl::new(),
            advanced_mutex: Mutex::new(()),
            advanced_condvar: Condvar::new(),
            logger_wakeup,
        });
        let advancer = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("epoch_advancer".into())
                .spawn(move || run_advancer(&shared, advance_interval))
                .unwrap()
        };
        Self {
            shared,
            advancer: Mutex::new(Some(advancer)),
        }
    }

    pub fn current_global_epoch(&self) -> Epoch {
        Epoch(self.shared.current_global_epoch.load(SeqCst))
    }

    pub fn current_global_epoch_weak(&self) -> Epoch {
        Epoch(self.shared.current_global_epoch.load(Relaxed))
    }

    /// Prods the advancer without waiting for the bump.
    pub fn wakeup_advancer(&self) {
        self.shared.advance_wakeup.wakeup();
    }

    /// Requests an immediate epoch bump and blocks until the global epoch
    /// has moved past the one observed on entry.
    ///
    /// The wait is a spinning re-check: each round signals the advancer
    /// again, so a signal that races with the advancer's own loop cannot
    /// strand the caller.
    pub fn advance_current_global_epoch(&self) -> Epoch {
        let start = self.current_global_epoch();
        debug!(current = %start, "requesting immediate epoch advance");
        while self.current_global_epoch() == start {
            self.shared.advance_wakeup.wakeup();
            let mut guard = self.shared.advanced_mutex.lock();
            if self.current_global_epoch() != start {
                break;
            }
            self.shared
                .advanced_condvar
                .wait_for(&mut guard, Duration::from_millis(10));
        }
        self.current_global_epoch()
    }

    /// Stops and joins the advancer thread. Idempotent.
    pub fn shutdown(&self) {
        self.shared.advance_wakeup.request_stop();
        if let Some(advancer) = self.advancer.lock().take() {
            let _ = advancer.join();
        }
    }
}

impl Drop for EpochFramework {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_advancer(shared: &SharedState, interval: Duration) {
    info!(?interval, "epoch advancer started");
    loop {
        if shared.advance_wakeup.sleep(interval) == Wakeup::StopRequested {
            break;
        }
        {
            let _guard = shared.advanced_mutex.lock();
            let current = Epoch(shared.current_global_epoch.load(SeqCst));
            debug_assert!(current.is_valid());
            shared
                .current_global_epoch
                .store(current.one_more().0, SeqCst);
            shared.advanced_condvar.notify_all();
        }
        shared.logger_wakeup.wakeup();
    }
    info!("epoch advancer ended");
}
