//! Compression: fixed-size chunks, one member per chunk.

use std::fs::File;
use std::ops::ControlFlow;
use std::path::Path;

use super::{BlockSink, Chunk, ChunkStrategy, ProgressPolicy};
use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::member::encode_member;

/// Cuts the input into `chunk_size` pieces (the last one possibly shorter)
/// and encodes each into a self-contained member with the configured codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Compression;

impl ChunkStrategy for Compression {
    fn progress_policy(&self) -> ProgressPolicy {
        ProgressPolicy::Mean
    }

    fn discover(
        &self,
        _path:     &Path,
        _input:    &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        for chunk in fixed_chunks(input_len, options.chunk_size as u64) {
            if emit(chunk).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn transform(
        &self,
        _chunk:  &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        let member = encode_member(data, options.codec, options.level)?;
        sink.push_last(member)?;
        Ok(())
    }
}

/// Chunk layout of an `input_len`-byte file cut every `chunk_size` bytes.
/// An empty input has no chunks.
pub fn fixed_chunks(input_len: u64, chunk_size: u64) -> impl Iterator<Item = Chunk> {
    let chunk_size = chunk_size.max(1);
    (0..input_len.div_ceil(chunk_size)).map(move |order| {
        let offset = order * chunk_size;
        Chunk { offset, len: chunk_size.min(input_len - offset), order }
    })
}
