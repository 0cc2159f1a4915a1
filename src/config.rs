//! Engine options.
//!
//! Every field has a default, so a JSON options file only needs the keys it
//! wants to change:
//!
//! ```json
//! { "chunk_size": 4194304, "workers": 8, "codec": "lz4" }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecId;
use crate::member::MEMBER_MAGIC;
use crate::scanner::DEFAULT_READ_BUFFER_SIZE;

/// Default compression chunk: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10;
/// Default decompression output slice: 1 MiB.
pub const DEFAULT_OUTPUT_SLICE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,
    #[error("workers must be greater than zero")]
    ZeroWorkers,
    #[error("max_queue_depth must be greater than zero")]
    ZeroQueueDepth,
    #[error("read_buffer_size must be at least {min} bytes, got {size}")]
    ReadBufferTooSmall { size: usize, min: usize },
    #[error("output_slice_size must be greater than zero")]
    ZeroSliceSize,
    #[error("poll_interval_ms must be greater than zero")]
    ZeroPollInterval,
    #[error("cannot read options file '{}': {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse options file '{}': {source}", .path.display())]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Bytes per compression chunk.
    pub chunk_size: usize,
    /// Transform workers allowed to run at once.
    pub workers: usize,
    /// Chunks allowed to sit transformed but unwritten.
    pub max_queue_depth: usize,
    /// Codec used when compressing.  Decompression reads it from each member.
    pub codec: CodecId,
    pub level: i32,
    /// Boundary scanner window.
    pub read_buffer_size: usize,
    /// Decompressed bytes per output block.
    pub output_slice_size: usize,
    /// Writer idle interval, also used to re-check cancellation while waiting.
    pub poll_interval_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            chunk_size:        DEFAULT_CHUNK_SIZE,
            workers:           num_cpus::get(),
            max_queue_depth:   DEFAULT_MAX_QUEUE_DEPTH,
            codec:             CodecId::Zstd,
            level:             3,
            read_buffer_size:  DEFAULT_READ_BUFFER_SIZE,
            output_slice_size: DEFAULT_OUTPUT_SLICE_SIZE,
            poll_interval_ms:  DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        if self.read_buffer_size < MEMBER_MAGIC.len() {
            return Err(ConfigError::ReadBufferTooSmall {
                size: self.read_buffer_size,
                min:  MEMBER_MAGIC.len(),
            });
        }
        if self.output_slice_size == 0 {
            return Err(ConfigError::ZeroSliceSize);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    /// Load options from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let options: EngineOptions = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        options.validate()?;
        Ok(options)
    }

    pub(crate) fn worker_limit(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.workers).ok_or(ConfigError::ZeroWorkers)
    }

    pub(crate) fn queue_depth_limit(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.max_queue_depth).ok_or(ConfigError::ZeroQueueDepth)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
