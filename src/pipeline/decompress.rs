//! Decompression: members found by scanning, each streamed back out in
//! fixed-size slices.
//!
//! # Discovery
//! The scanner looks for [`MEMBER_MAGIC`] from the end of the previous
//! member.  A hit is only a candidate: its header must parse and pass its
//! checksum, otherwise the scan resumes one byte later.  Members are written
//! back to back, so the next valid member must start exactly where the last
//! one ended.  Any byte that belongs to no member (leading junk, a damaged
//! header, trailing data) fails the run with [`FrameError::Gap`], as does a
//! member whose declared length runs past the end of the file.
//!
//! # Sub-ordering
//! A member can decode to far more bytes than it occupies.  Its output is
//! pushed as `output_slice_size` blocks, each the next sub-order of the
//! member's chunk, so no worker ever holds a whole decoded member.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;
use tracing::warn;

use super::{BlockSink, Chunk, ChunkStrategy, ProgressPolicy};
use crate::codec::{read_full, CodecError};
use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::member::{open_member, FrameError, MemberHeader, MEMBER_HEADER_SIZE, MEMBER_MAGIC};
use crate::scanner::{BoundaryScanner, PatternScanner};

#[derive(Debug, Default, Clone)]
pub struct Decompression<B: BoundaryScanner = PatternScanner> {
    scanner: B,
}

impl<B: BoundaryScanner> Decompression<B> {
    pub fn with_scanner(scanner: B) -> Self {
        Decompression { scanner }
    }
}

impl<B: BoundaryScanner + 'static> ChunkStrategy for Decompression<B> {
    fn progress_policy(&self) -> ProgressPolicy {
        // The member count is unknown until the scan ends.
        ProgressPolicy::Product
    }

    fn discover(
        &self,
        path:      &Path,
        input:     &mut File,
        input_len: u64,
        options:   &EngineOptions,
        emit:      &mut dyn FnMut(Chunk) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let io_err = |e: std::io::Error| EngineError::io(path, e);
        // `next` is where the next member has to start; `scan` runs ahead of
        // it while rejecting false boundaries.
        let mut next = 0u64;
        let mut scan = 0u64;
        let mut order = 0u64;

        loop {
            input.seek(SeekFrom::Start(scan)).map_err(io_err)?;
            let hit = self
                .scanner
                .next_member_offset(input, &MEMBER_MAGIC, options.read_buffer_size)
                .map_err(io_err)?;

            let Some(hit) = hit else {
                if order == 0 && input_len > 0 {
                    return Err(EngineError::NoMembers(path.to_path_buf()));
                }
                if next < input_len {
                    return Err(FrameError::Gap { offset: next, bytes: input_len - next }.into());
                }
                return Ok(());
            };

            let available = input_len - hit;
            if available < MEMBER_HEADER_SIZE as u64 {
                return Err(FrameError::Truncated {
                    offset: hit,
                    needed: MEMBER_HEADER_SIZE as u64,
                    available,
                }
                .into());
            }

            input.seek(SeekFrom::Start(hit)).map_err(io_err)?;
            let mut head = [0u8; MEMBER_HEADER_SIZE];
            input.read_exact(&mut head).map_err(io_err)?;
            let header = match MemberHeader::parse(&head) {
                Ok(header) => header,
                Err(e) => {
                    warn!(offset = hit, error = %e, "rejecting false member boundary, resyncing");
                    scan = hit + 1;
                    continue;
                }
            };

            if hit > next {
                return Err(FrameError::Gap { offset: next, bytes: hit - next }.into());
            }
            // An unrepresentable length can never fit in what is left.
            let member_len = header.member_len().unwrap_or(u64::MAX);
            if member_len > available {
                return Err(FrameError::Truncated { offset: hit, needed: member_len, available }.into());
            }

            if emit(Chunk { offset: hit, len: member_len, order }).is_break() {
                return Ok(());
            }
            order += 1;
            // member_len <= input_len - hit, so this stays within the file.
            next = hit + member_len;
            scan = next;
        }
    }

    fn transform(
        &self,
        chunk:   &Chunk,
        data:    &[u8],
        options: &EngineOptions,
        sink:    &mut BlockSink<'_>,
    ) -> Result<(), EngineError> {
        let member = open_member(data, chunk.offset)?;
        let declared = member.header.orig_size;
        let codec = member
            .header
            .codec_id()
            .ok_or(CodecError::UnknownCodec(member.header.codec))?;
        let mut decoder = member.decoder()?;

        let mut produced = 0u64;
        loop {
            let mut slice = vec![0u8; options.output_slice_size];
            let n = read_full(&mut decoder, &mut slice)
                .map_err(|e| CodecError::Decompression { codec, message: e.to_string() })?;
            if n == 0 {
                break;
            }
            produced += n as u64;
            if produced > declared {
                // Stop before decoding further than the header allows.
                return Err(FrameError::SizeMismatch { offset: chunk.offset, declared, actual: produced }.into());
            }
            slice.truncate(n);
            sink.push(slice)?;
            if n < options.output_slice_size {
                break;
            }
        }

        if produced != declared {
            return Err(FrameError::SizeMismatch { offset: chunk.offset, declared, actual: produced }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::member::encode_member;
    use std::io::Write;

    fn archive(parts: &[&[u8]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for part in parts {
            file.write_all(part).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn discover_all(file: &tempfile::NamedTempFile) -> Result<Vec<Chunk>, EngineError> {
        let len = file.as_file().metadata().unwrap().len();
        let mut handle = File::open(file.path()).unwrap();
        let mut chunks = Vec::new();
        Decompression::<PatternScanner>::default().discover(
            file.path(),
            &mut handle,
            len,
            &EngineOptions { read_buffer_size: 16, ..EngineOptions::default() },
            &mut |c: Chunk| {
                chunks.push(c);
                ControlFlow::Continue(())
            },
        )?;
        Ok(chunks)
    }

    #[test]
    fn members_are_found_back_to_back() {
        let a = encode_member(&[7u8; 100], CodecId::Zstd, 3).unwrap();
        let b = encode_member(b"second", CodecId::None, 0).unwrap();
        let file = archive(&[&a, &b]);

        let chunks = discover_all(&file).unwrap();
        assert_eq!(
            chunks,
            vec![
                Chunk { offset: 0, len: a.len() as u64, order: 0 },
                Chunk { offset: a.len() as u64, len: b.len() as u64, order: 1 },
            ]
        );
    }

    fn gap_at(file: &tempfile::NamedTempFile) -> Option<(u64, u64)> {
        match discover_all(file) {
            Err(EngineError::Frame(FrameError::Gap { offset, bytes })) => Some((offset, bytes)),
            _ => None,
        }
    }

    #[test]
    fn leading_junk_and_false_magic_are_a_gap() {
        let a = encode_member(b"alpha", CodecId::None, 0).unwrap();
        let mut junk = b"xx".to_vec();
        junk.extend_from_slice(&MEMBER_MAGIC);
        junk.extend_from_slice(&[0u8; 40]);
        let file = archive(&[&junk, &a]);

        assert_eq!(gap_at(&file), Some((0, junk.len() as u64)));
    }

    #[test]
    fn bytes_between_members_are_a_gap() {
        let a = encode_member(b"alpha", CodecId::None, 0).unwrap();
        let b = encode_member(b"beta", CodecId::None, 0).unwrap();
        let file = archive(&[&a, b"xx", &b]);

        assert_eq!(gap_at(&file), Some((a.len() as u64, 2)));
    }

    #[test]
    fn trailing_bytes_are_a_gap() {
        let a = encode_member(b"alpha", CodecId::None, 0).unwrap();
        let file = archive(&[&a, b"tail"]);

        assert_eq!(gap_at(&file), Some((a.len() as u64, 4)));
    }

    #[test]
    fn damaged_header_is_not_skipped() {
        let a = encode_member(b"alpha", CodecId::None, 0).unwrap();
        let mut b = encode_member(b"beta", CodecId::None, 0).unwrap();
        let c = encode_member(b"gamma", CodecId::None, 0).unwrap();
        b[10] ^= 0xFF;

        let middle = archive(&[&a, &b, &c]);
        assert_eq!(gap_at(&middle), Some((a.len() as u64, b.len() as u64)));

        let last = archive(&[&a, &b]);
        assert_eq!(gap_at(&last), Some((a.len() as u64, b.len() as u64)));
    }

    #[test]
    fn input_without_members_is_rejected() {
        let file = archive(&[b"plain text, nothing compressed here"]);
        assert!(matches!(discover_all(&file), Err(EngineError::NoMembers(_))));

        let empty = archive(&[]);
        assert!(discover_all(&empty).unwrap().is_empty());
    }

    #[test]
    fn oversized_comp_size_is_truncated() {
        let header = MemberHeader {
            codec:         CodecId::None.tag(),
            level:         0,
            flags:         0,
            orig_size:     0,
            comp_size:     u64::MAX - 8,
            payload_crc32: 0,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        bytes.extend_from_slice(&[0u8; 64]);
        let file = archive(&[&bytes]);

        assert!(matches!(
            discover_all(&file),
            Err(EngineError::Frame(FrameError::Truncated { offset: 0, needed: u64::MAX, available: 96 }))
        ));
    }

    #[test]
    fn member_running_past_eof_is_truncated() {
        let a = encode_member(&[1u8; 64], CodecId::None, 0).unwrap();
        let file = archive(&[&a[..a.len() - 10]]);
        assert!(matches!(
            discover_all(&file),
            Err(EngineError::Frame(FrameError::Truncated { offset: 0, .. }))
        ));
    }
}
