//! A control block for long-running daemon threads: a stop flag, a wakeup
//! ticket, and a condvar. Threads sleep with a timeout and learn whether
//! they were woken by a signal, a timeout, or a stop request.

use parking_lot::{Condvar, Mutex};
use std::{
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::{Duration, Instant},
};

#[derive(Default)]
pub struct StopControl {
    ticket: Mutex<u64>,
    condvar: Condvar,
    stop_requested: AtomicBool,
}

/// What ended a [`StopControl::sleep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Signaled,
    TimedOut,
    StopRequested,
}

impl StopControl {
    pub fn new() -> Self {
        Default::default()
    }

    /// Wakes up every thread currently sleeping on this control.
    pub fn wakeup(&self) {
        let mut ticket = self.ticket.lock();
        *ticket += 1;
        self.condvar.notify_all();
    }

    /// Requests all sleepers to stop and wakes them.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, SeqCst);
        self.wakeup();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(SeqCst)
    }

    /// Sleeps until a wakeup signal, the timeout, or a stop request.
    pub fn sleep(&self, timeout: Duration) -> Wakeup {
        if self.is_stop_requested() {
            return Wakeup::StopRequested;
        }
        let deadline = Instant::now() + timeout;
        let mut ticket = self.ticket.lock();
        let seen = *ticket;
        while *ticket == seen && !self.is_stop_requested() {
            if self
                .condvar
                .wait_until(&mut ticket, deadline)
                .timed_out()
            {
                break;
            }
        }
        if self.is_stop_requested() {
            Wakeup::StopRequested
        } else if *ticket != seen {
            Wakeup::Signaled
        } else {
            Wakeup::TimedOut
        }
    }
}
