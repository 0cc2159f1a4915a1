//! Synchronisation primitives the pipeline is built from.
//!
//! - [`gate`]: counting admission gate with movable RAII permits
//! - [`scheduler`]: thread-per-task worker launcher capped by a gate
//! - [`ordered_queue`]: out-of-order insert, in-order release buffer

pub mod gate;
pub mod ordered_queue;
pub mod scheduler;

pub use gate::{BoundedGate, GatePermit};
pub use ordered_queue::{OrderKey, OrderedQueue, QueueError};
pub use scheduler::WorkerScheduler;
