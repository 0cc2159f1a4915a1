pub mod codec;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod events;
pub mod member;
pub mod pipeline;
pub mod scanner;

pub use codec::{CodecId, get_codec};
pub use config::EngineOptions;
pub use error::EngineError;
pub use events::{Completion, CompletionStatus, ProgressEvent};
pub use pipeline::{
    BlockSink, Chunk, ChunkStrategy, Compression, Compressor, Decompression, Decompressor,
    Engine, ProgressPolicy, RunHandle,
};
