//! Notifications a run sends to its host.
//!
//! Progress is best-effort: fractions are sampled from counters other
//! threads are still updating, so a reported value is eventually consistent
//! with the bytes on disk, not transactionally tied to them.  It never goes
//! backwards within a run.  Completion is sent exactly once, after every
//! stage has stopped.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// In `[0.0, 1.0]`.
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Succeeded,
    Cancelled,
    Faulted,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompletionStatus::Succeeded => "succeeded",
            CompletionStatus::Cancelled => "cancelled",
            CompletionStatus::Faulted   => "faulted",
        })
    }
}

/// Terminal report of one run.
///
/// Byte counts are only filled in on success; a cancelled run carries no
/// errors, a faulted one carries every error recorded, in record order.
#[derive(Debug)]
pub struct Completion {
    pub status:       CompletionStatus,
    pub input_bytes:  u64,
    pub output_bytes: u64,
    pub errors:       Vec<EngineError>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Succeeded
    }
}

pub type ProgressCallback  = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
pub type CompletedCallback = Arc<dyn Fn(&Completion) + Send + Sync>;
