//! Bounded worker scheduler.
//!
//! Every submitted task runs on its own OS thread, but never more than
//! `max_workers` at once: [`WorkerScheduler::submit`] blocks the caller on a
//! [`BoundedGate`] until a worker slot is free.  The slot is held by the
//! worker thread itself and is returned when the task ends, whether it
//! returns or unwinds, so a panicking task can neither take the scheduler
//! down nor leak its slot.  Reporting the failure is the task's job.

use parking_lot::Mutex;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

use super::gate::BoundedGate;

pub struct WorkerScheduler {
    gate:    Arc<BoundedGate>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicU64,
    name:    String,
}

impl WorkerScheduler {
    pub fn new(max_workers: NonZeroUsize) -> Self {
        Self::with_name(max_workers, "blockzip-worker")
    }

    /// Worker threads are named `{name}-{n}`.
    pub fn with_name(max_workers: NonZeroUsize, name: impl Into<String>) -> Self {
        WorkerScheduler {
            gate:    Arc::new(BoundedGate::new(max_workers)),
            handles: Mutex::new(Vec::new()),
            spawned: AtomicU64::new(0),
            name:    name.into(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.gate.capacity()
    }

    /// Workers admitted and not yet finished.
    ///
    /// A snapshot for termination decisions: it may be stale by the time the
    /// caller looks at it, but a task's slot is taken before `submit` returns
    /// and given back only after the task body has finished.
    pub fn active_count(&self) -> usize {
        self.gate.held()
    }

    /// Start `task` on a new worker once a slot is free.
    ///
    /// Blocks while `max_workers` tasks are running.  Fails only if the OS
    /// refuses to spawn a thread, in which case the slot is given back.
    pub fn submit<F>(&self, task: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.gate.permit();
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || {
                let _slot = permit;
                debug!(worker = id, "worker started");
                task();
                debug!(worker = id, "worker finished");
            })?;

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Wait for every task submitted so far to finish.
    pub fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            // A panicking task has already released its slot; there is
            // nothing left to recover from its join result.
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler(n: usize) -> WorkerScheduler {
        WorkerScheduler::new(NonZeroUsize::new(n).unwrap())
    }

    #[test]
    fn never_exceeds_cap() {
        let sched   = scheduler(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak    = Arc::new(AtomicUsize::new(0));
        let done    = Arc::new(AtomicUsize::new(0));

        for _ in 0..24 {
            let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
            sched
                .submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(sched.active_count() <= 3);
        }
        sched.join_all();

        assert_eq!(done.load(Ordering::SeqCst), 24);
        assert!(peak.load(Ordering::SeqCst) <= 3, "peak {}", peak.load(Ordering::SeqCst));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn panicking_task_frees_its_slot() {
        let sched = scheduler(1);
        sched.submit(|| panic!("task failure")).unwrap();
        // With a single slot this only gets admitted if the panic released it.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        sched.submit(move || { r.fetch_add(1, Ordering::SeqCst); }).unwrap();
        sched.join_all();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sched.active_count(), 0);
    }
}
