//! Boundary scanner: locate the next member inside a raw byte stream.
//!
//! # How it works
//!
//! The scanner reads forward from the stream's current position in windows
//! of `read_buffer_size` bytes and reports the absolute offset of the first
//! occurrence of the header pattern.  Consecutive windows overlap by
//! `pattern.len() - 1` bytes so a pattern straddling two windows is still
//! found.  Memory use is bounded by one window regardless of file size.
//!
//! Not finding the pattern is a normal outcome (`Ok(None)`: no further
//! members), never an error.  Only genuine I/O failures propagate.
//!
//! A pattern hit says nothing about whether a valid member starts there;
//! that is for the caller to decide (see `pipeline::decompress`), resuming
//! the scan one byte past a rejected hit.

use std::io::{self, Read, Seek, SeekFrom};

use crate::codec::read_full;

/// Default scan window: 64 KiB.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Locates codec-member boundaries in a seekable stream.
pub trait BoundaryScanner: Send + Sync {
    /// Return the absolute offset of the next `pattern` occurrence at or after
    /// the stream's current position, leaving the stream positioned there.
    /// Returns `Ok(None)` when the stream holds no further occurrence.
    fn next_member_offset<R: Read + Seek>(
        &self,
        stream:           &mut R,
        pattern:          &[u8],
        read_buffer_size: usize,
    ) -> io::Result<Option<u64>>;
}

/// Windowed byte-pattern search.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternScanner;

impl BoundaryScanner for PatternScanner {
    fn next_member_offset<R: Read + Seek>(
        &self,
        stream:           &mut R,
        pattern:          &[u8],
        read_buffer_size: usize,
    ) -> io::Result<Option<u64>> {
        if pattern.is_empty() || read_buffer_size < pattern.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "scan window of {read_buffer_size} bytes cannot hold a {}-byte pattern",
                    pattern.len()
                ),
            ));
        }

        let mut window = vec![0u8; read_buffer_size];
        let mut window_start = stream.stream_position()?;

        loop {
            let filled = read_full(stream, &mut window)?;
            if filled < pattern.len() {
                return Ok(None);
            }

            if let Some(i) = find(&window[..filled], pattern) {
                let hit = window_start + i as u64;
                stream.seek(SeekFrom::Start(hit))?;
                return Ok(Some(hit));
            }

            if filled < window.len() {
                // Short read: end of stream reached without a hit.
                return Ok(None);
            }

            // Re-read the tail so a pattern split across windows is seen whole.
            window_start += (filled - (pattern.len() - 1)) as u64;
            stream.seek(SeekFrom::Start(window_start))?;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
