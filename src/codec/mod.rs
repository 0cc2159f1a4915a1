//! Codec registry: one-byte codec tags + the opaque compress/decompress
//! transform applied to each chunk.
//!
//! # Identity rules
//! Every codec is identified by a one-byte [`CodecId`] tag.  That tag is
//! written into every member header on disk and is the only thing a
//! decompressor needs to pick the right decoder.  Tags are permanent: a
//! value is NEVER reused, even if a codec is removed from a later build.
//!
//! # Streaming decode
//! Decompression may produce far more bytes than the member it came from.
//! [`Codec::decoder`] exposes the decoded stream as a `Read` so the pipeline
//! can hand out fixed-size output slices instead of materialising a whole
//! member in memory.  Codecs without a streaming decoder fall back to a
//! cursor over [`Codec::decompress`].

use std::io::{self, Cursor, Read, Write};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── CodecId enum ─────────────────────────────────────────────────────────────

/// Runtime codec discriminant.  The `u8` value is the on-disk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CodecId {
    None   = 0,
    Zstd   = 1,
    Lz4    = 2,
    Brotli = 3,
    Lzma   = 4,
    Gzip   = 5,
}

impl CodecId {
    /// Every codec known to this build, in tag order.
    pub const ALL: [CodecId; 6] = [
        CodecId::None,
        CodecId::Zstd,
        CodecId::Lz4,
        CodecId::Brotli,
        CodecId::Lzma,
        CodecId::Gzip,
    ];

    /// On-disk tag.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Resolve an on-disk tag.
    /// Returns `None` if the tag is not recognised by this build.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CodecId::None),
            1 => Some(CodecId::Zstd),
            2 => Some(CodecId::Lz4),
            3 => Some(CodecId::Brotli),
            4 => Some(CodecId::Lzma),
            5 => Some(CodecId::Gzip),
            _ => None,
        }
    }

    /// Human-readable name (for diagnostics and the CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
            CodecId::Gzip   => "gzip",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "store" => Some(CodecId::None),
            "zstd"           => Some(CodecId::Zstd),
            "lz4"            => Some(CodecId::Lz4),
            "brotli"         => Some(CodecId::Brotli),
            "lzma"           => Some(CodecId::Lzma),
            "gzip" | "gz"    => Some(CodecId::Gzip),
            _                => None,
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{codec} compression error: {message}")]
    Compression { codec: CodecId, message: String },
    #[error("{codec} decompression error: {message}")]
    Decompression { codec: CodecId, message: String },
    /// The member header names a codec tag this build does not know.
    #[error("unknown codec tag {0:#04x}")]
    UnknownCodec(u8),
}

impl CodecError {
    fn compression(codec: CodecId, err: impl std::fmt::Display) -> Self {
        CodecError::Compression { codec, message: err.to_string() }
    }

    fn decompression(codec: CodecId, err: impl std::fmt::Display) -> Self {
        CodecError::Decompression { codec, message: err.to_string() }
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decoded view of `data` as a byte stream.
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        Ok(Box::new(Cursor::new(self.decompress(data)?)))
    }
}

fn read_all(codec: CodecId, mut reader: impl Read) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| CodecError::decompression(codec, e))?;
    Ok(out)
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8])        -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        Ok(Box::new(data))
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::compression(CodecId::Zstd, e))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::decompression(CodecId::Zstd, e))
    }
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        let dec = zstd::stream::read::Decoder::new(data)
            .map_err(|e| CodecError::decompression(CodecId::Zstd, e))?;
        Ok(Box::new(dec))
    }
}

/// LZ4 in the frame format, so the decoder can stream.
pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2));
        enc.write_all(data).map_err(|e| CodecError::compression(CodecId::Lz4, e))?;
        enc.finish().map_err(|e| CodecError::compression(CodecId::Lz4, e))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        read_all(CodecId::Lz4, lz4_flex::frame::FrameDecoder::new(data))
    }
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        Ok(Box::new(lz4_flex::frame::FrameDecoder::new(data)))
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::compression(CodecId::Brotli, e))?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        read_all(CodecId::Brotli, brotli::Decompressor::new(data, 4096))
    }
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        Ok(Box::new(brotli::Decompressor::new(data, 4096)))
    }
}

/// LZMA has no streaming reader in `lzma-rs`; the default `decoder` is used.
pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out)
            .map_err(|e| CodecError::compression(CodecId::Lzma, e))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out)
            .map_err(|e| CodecError::decompression(CodecId::Lzma, e))?;
        Ok(out)
    }
}

/// A single gzip member per chunk.
pub struct GzipCodec;
impl Codec for GzipCodec {
    fn codec_id(&self) -> CodecId { CodecId::Gzip }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let level = flate2::Compression::new(level.clamp(0, 9) as u32);
        let mut enc = flate2::write::GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
        enc.write_all(data).map_err(|e| CodecError::compression(CodecId::Gzip, e))?;
        enc.finish().map_err(|e| CodecError::compression(CodecId::Gzip, e))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        read_all(CodecId::Gzip, flate2::read::GzDecoder::new(data))
    }
    fn decoder<'a>(&self, data: &'a [u8]) -> Result<Box<dyn Read + 'a>, CodecError> {
        Ok(Box::new(flate2::read::GzDecoder::new(data)))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve an on-disk tag to a built-in codec.
///
/// Returns `Err(CodecError::UnknownCodec)` if the tag is not recognised.
/// The caller MUST NOT fall back to any other codec.
pub fn get_codec_by_tag(tag: u8) -> Result<Box<dyn Codec>, CodecError> {
    match CodecId::from_tag(tag) {
        Some(id) => Ok(get_codec(id)),
        None     => Err(CodecError::UnknownCodec(tag)),
    }
}

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lzma   => Box::new(LzmaCodec),
        CodecId::Gzip   => Box::new(GzipCodec),
    }
}

/// Drain `reader` into `buf` until it is full or the stream ends.
/// Returns the number of bytes placed in `buf`.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0)  => break,
            Ok(n)  => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
