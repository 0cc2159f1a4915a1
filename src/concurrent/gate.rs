//! Counting admission gate.
//!
//! Keeps the number of outstanding admissions at or below a fixed capacity.
//! Callers block in [`BoundedGate::acquire`] until a slot frees up.  The
//! RAII [`GatePermit`] is the usual way in: it can be moved to another
//! thread and gives its slot back when dropped, which is how a slot taken by
//! the reader is returned by whichever thread finishes with the work.

use parking_lot::{Condvar, Mutex};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct BoundedGate {
    held:     Mutex<usize>,
    cv:       Condvar,
    capacity: usize,
}

impl BoundedGate {
    pub fn new(capacity: NonZeroUsize) -> Self {
        BoundedGate {
            held:     Mutex::new(0),
            cv:       Condvar::new(),
            capacity: capacity.get(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admissions currently held.
    pub fn held(&self) -> usize {
        *self.held.lock()
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        while *held >= self.capacity {
            self.cv.wait(&mut held);
        }
        *held += 1;
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held >= self.capacity {
            return false;
        }
        *held += 1;
        true
    }

    /// Like [`acquire`](Self::acquire) but gives up once `cancelled` is set.
    /// The flag is re-checked at least every `poll`.  Returns whether a slot
    /// was taken.
    pub fn acquire_unless(&self, cancelled: &AtomicBool, poll: Duration) -> bool {
        let mut held = self.held.lock();
        loop {
            if cancelled.load(Ordering::SeqCst) {
                return false;
            }
            if *held < self.capacity {
                *held += 1;
                return true;
            }
            self.cv.wait_for(&mut held, poll);
        }
    }

    /// Give a slot back.
    ///
    /// # Panics
    /// Releasing more slots than were acquired is a broken invariant, not a
    /// recoverable condition.
    pub fn release(&self) {
        let mut held = self.held.lock();
        assert!(*held > 0, "BoundedGate released more times than acquired");
        *held -= 1;
        drop(held);
        self.cv.notify_one();
    }

    /// Blocking acquire that returns an owned permit.
    pub fn permit(self: &Arc<Self>) -> GatePermit {
        self.acquire();
        GatePermit { gate: Arc::clone(self) }
    }

    /// Cancellable acquire that returns an owned permit.
    pub fn permit_unless(self: &Arc<Self>, cancelled: &AtomicBool, poll: Duration) -> Option<GatePermit> {
        self.acquire_unless(cancelled, poll)
            .then(|| GatePermit { gate: Arc::clone(self) })
    }
}

/// One held admission; released on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<BoundedGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
