//! Run-level error type.
//!
//! Everything that can go wrong inside a run ends up as an [`EngineError`]
//! in the completion's error list.  Only two errors are returned
//! synchronously from `execute`: a missing input and a reused engine.

use std::any::Any;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;
use crate::concurrent::QueueError;
use crate::config::ConfigError;
use crate::member::FrameError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("input file '{}' does not exist", .0.display())]
    InputNotFound(PathBuf),

    #[error("engine has already been executed; create a new one for another run")]
    AlreadyUsed,

    /// An I/O error, with the path it happened on.
    #[error("I/O error on path '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The ordered queue rejected an insert: the pipeline broke its own
    /// ordering contract.
    #[error("ordering fault: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("{stage} panicked: {message}")]
    Panic { stage: &'static str, message: String },

    #[error("'{}' contains no compressed members", .0.display())]
    NoMembers(PathBuf),

    /// Every producer finished but the block the writer needs next never arrived.
    #[error("output stalled waiting for block {order}:{sub_order}")]
    Stalled { order: u64, sub_order: u32 },

    #[error("could not spawn {what} thread: {source}")]
    Spawn { what: &'static str, source: io::Error },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Io { path: path.into(), source }
    }

    /// Turn a caught panic payload into an error.
    pub(crate) fn from_panic(stage: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        EngineError::Panic { stage, message }
    }
}
