//! Progress bookkeeping for one run.
//!
//! Three stage fractions feed the reported value: input bytes discovered,
//! chunks transformed out of chunks discovered so far, and chunks written out
//! of chunks discovered so far.  The chunk denominator keeps growing while
//! discovery runs, so a fresh value can come out lower than the last one;
//! such regressions are clamped away before anything is reported.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::{ProgressCallback, ProgressEvent};

/// How the stage fractions combine into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPolicy {
    /// Arithmetic mean of the three fractions.
    Mean,
    /// Product of the three fractions.  Stays pessimistic while the total
    /// chunk count is still unknown.
    Product,
}

impl ProgressPolicy {
    pub fn combine(self, discovered: f64, transformed: f64, written: f64) -> f64 {
        match self {
            ProgressPolicy::Mean    => (discovered + transformed + written) / 3.0,
            ProgressPolicy::Product => discovered * transformed * written,
        }
    }
}

pub(crate) struct ProgressTracker {
    policy:           ProgressPolicy,
    input_len:        u64,
    discovered_bytes: AtomicU64,
    chunks_found:     AtomicU64,
    transformed:      AtomicU64,
    written:          AtomicU64,
    last:             Mutex<f64>,
    callback:         Option<ProgressCallback>,
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

impl ProgressTracker {
    pub(crate) fn new(policy: ProgressPolicy, input_len: u64, callback: Option<ProgressCallback>) -> Self {
        ProgressTracker {
            policy,
            input_len,
            discovered_bytes: AtomicU64::new(0),
            chunks_found:     AtomicU64::new(0),
            transformed:      AtomicU64::new(0),
            written:          AtomicU64::new(0),
            last:             Mutex::new(0.0),
            callback,
        }
    }

    /// The reader found a chunk ending at `end_offset`.
    pub(crate) fn chunk_discovered(&self, end_offset: u64) {
        self.discovered_bytes.fetch_max(end_offset, Ordering::Relaxed);
        self.chunks_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_transformed(&self) {
        self.transformed.fetch_add(1, Ordering::Relaxed);
    }

    /// `orders` chunks have been fully written.
    pub(crate) fn chunks_written(&self, orders: u64) {
        self.written.fetch_max(orders, Ordering::Relaxed);
    }

    pub(crate) fn current(&self) -> f64 {
        let found = self.chunks_found.load(Ordering::Relaxed);
        let discovered = if self.input_len == 0 {
            1.0
        } else {
            fraction(self.discovered_bytes.load(Ordering::Relaxed), self.input_len)
        };
        self.policy.combine(
            discovered,
            fraction(self.transformed.load(Ordering::Relaxed), found),
            fraction(self.written.load(Ordering::Relaxed), found),
        )
    }

    /// Recompute, clamp to the last reported value and notify.  Returns what
    /// was reported.
    pub(crate) fn report(&self) -> f64 {
        self.publish(self.current())
    }

    /// Report completion: exactly 1.0.
    pub(crate) fn finish(&self) -> f64 {
        self.publish(1.0)
    }

    fn publish(&self, value: f64) -> f64 {
        // Held across the callback so observers see events one at a time and
        // in non-decreasing order.
        let mut last = self.last.lock();
        let value = value.clamp(*last, 1.0);
        *last = value;
        if let Some(cb) = &self.callback {
            cb(ProgressEvent { percentage: value });
        }
        value
    }
}
