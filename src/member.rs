//! Member framing: the self-describing unit one compressed chunk becomes.
//!
//! A compressed file is nothing more than members concatenated in chunk
//! order.  Each member can be decoded on its own, which is what lets the
//! decompressor fan members out to independent workers.
//!
//! # Layout (little-endian, 32 bytes + payload)
//! ```text
//! magic[4] | version u8 | codec u8 | level i8 | flags u8
//! orig_size u64 | comp_size u64 | payload_crc32 u32 | header_crc32 u32
//! ```
//! `header_crc32` covers the 28 bytes before it, so a magic match that
//! happens to occur inside some payload is rejected by the scanner instead
//! of being mistaken for a boundary.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::codec::{get_codec, get_codec_by_tag, CodecError, CodecId};

/// Byte pattern that opens every member.
pub const MEMBER_MAGIC: [u8; 4] = [0xB1, 0x0C, 0x4B, 0x5A];
pub const MEMBER_VERSION: u8 = 1;
pub const MEMBER_HEADER_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("bad member magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported member version {0}")]
    UnsupportedVersion(u8),
    #[error("member header checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    HeaderChecksum { stored: u32, computed: u32 },
    #[error("member payload checksum mismatch at offset {offset}")]
    PayloadChecksum { offset: u64 },
    #[error("member at offset {offset} decoded to {actual} bytes, header declares {declared}")]
    SizeMismatch { offset: u64, declared: u64, actual: u64 },
    #[error("member at offset {offset} needs {needed} bytes but only {available} remain")]
    Truncated { offset: u64, needed: u64, available: u64 },
    #[error("{bytes} bytes at offset {offset} belong to no member")]
    Gap { offset: u64, bytes: u64 },
    #[error("member header I/O: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHeader {
    pub codec:         u8,
    pub level:         i8,
    pub flags:         u8,
    pub orig_size:     u64,
    pub comp_size:     u64,
    pub payload_crc32: u32,
}

impl MemberHeader {
    /// Total on-disk length of the member this header opens, or `None` if
    /// `comp_size` is too large for the sum to fit in a `u64`.
    pub fn member_len(&self) -> Option<u64> {
        (MEMBER_HEADER_SIZE as u64).checked_add(self.comp_size)
    }

    pub fn codec_id(&self) -> Option<CodecId> {
        CodecId::from_tag(self.codec)
    }

    fn body(&self) -> [u8; MEMBER_HEADER_SIZE - 4] {
        let mut body = [0u8; MEMBER_HEADER_SIZE - 4];
        let mut w = &mut body[..];
        // Writes into a fixed-size array of exactly the right length cannot fail.
        let _ = w.write_all(&MEMBER_MAGIC);
        let _ = w.write_u8(MEMBER_VERSION);
        let _ = w.write_u8(self.codec);
        let _ = w.write_i8(self.level);
        let _ = w.write_u8(self.flags);
        let _ = w.write_u64::<LittleEndian>(self.orig_size);
        let _ = w.write_u64::<LittleEndian>(self.comp_size);
        let _ = w.write_u32::<LittleEndian>(self.payload_crc32);
        body
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let body = self.body();
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        Ok(())
    }

    /// Parse and validate a header from exactly [`MEMBER_HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8; MEMBER_HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut r = &bytes[..];
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MEMBER_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = r.read_u8()?;
        if version != MEMBER_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let header = MemberHeader {
            codec:         r.read_u8()?,
            level:         r.read_i8()?,
            flags:         r.read_u8()?,
            orig_size:     r.read_u64::<LittleEndian>()?,
            comp_size:     r.read_u64::<LittleEndian>()?,
            payload_crc32: r.read_u32::<LittleEndian>()?,
        };
        let stored   = r.read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(&bytes[..MEMBER_HEADER_SIZE - 4]);
        if stored != computed {
            return Err(FrameError::HeaderChecksum { stored, computed });
        }
        Ok(header)
    }
}

/// Compress `data` and frame it as one complete member (header + payload).
pub fn encode_member(data: &[u8], codec_id: CodecId, level: i32) -> Result<Vec<u8>, CodecError> {
    let payload = get_codec(codec_id).compress(data, level)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let header = MemberHeader {
        codec:         codec_id.tag(),
        level:         level.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
        flags:         0,
        orig_size:     data.len() as u64,
        comp_size:     payload.len() as u64,
        payload_crc32: hasher.finalize(),
    };
    let mut out = Vec::with_capacity(MEMBER_HEADER_SIZE + payload.len());
    header
        .write(&mut out)
        .map_err(|e| CodecError::Compression { codec: codec_id, message: e.to_string() })?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// A validated member whose payload can be streamed back out.
#[derive(Debug)]
pub struct DecodedMember<'a> {
    pub header:  MemberHeader,
    pub payload: &'a [u8],
}

/// Split `member` (header + payload, as read from disk at `offset`) and
/// verify the payload checksum.
pub fn open_member(member: &[u8], offset: u64) -> Result<DecodedMember<'_>, FrameError> {
    if member.len() < MEMBER_HEADER_SIZE {
        return Err(FrameError::Truncated {
            offset,
            needed:    MEMBER_HEADER_SIZE as u64,
            available: member.len() as u64,
        });
    }
    let (head, payload) = member.split_at(MEMBER_HEADER_SIZE);
    let mut head_buf = [0u8; MEMBER_HEADER_SIZE];
    head_buf.copy_from_slice(head);
    let header = MemberHeader::parse(&head_buf)?;
    if payload.len() as u64 != header.comp_size {
        return Err(FrameError::Truncated {
            offset,
            needed:    header.comp_size,
            available: payload.len() as u64,
        });
    }
    if crc32fast::hash(payload) != header.payload_crc32 {
        return Err(FrameError::PayloadChecksum { offset });
    }
    Ok(DecodedMember { header, payload })
}

impl<'a> DecodedMember<'a> {
    /// Streaming decoder over the member payload.
    pub fn decoder(&self) -> Result<Box<dyn Read + 'a>, CodecError> {
        get_codec_by_tag(self.header.codec)?.decoder(self.payload)
    }
}
