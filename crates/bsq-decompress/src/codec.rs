//! Block codecs.
//!
//! Zlib is inflated as a stream, one device buffer in and one page out at a
//! time. LZ4 and zstd only expose whole-buffer block APIs, so their input is
//! gathered first and the output bounded by the actor capacity.

use crate::{CodecError, Decompressor, PageActor};
use bsq_block::{RawBlockSet, try_alloc_zeroed};
use bsq_error::BsqError;
use bsq_types::CompressionId;
use flate2::{Decompress, FlushDecompress, Status};
use tracing::trace;

/// Codec bound to a mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zlib,
    Lz4,
    Zstd,
    /// Passes bytes through unchanged.
    Identity,
}

impl Codec {
    /// Select the codec for a superblock compression id.
    pub fn for_id(id: CompressionId) -> Result<Self, BsqError> {
        match id {
            CompressionId::Zlib => Ok(Self::Zlib),
            CompressionId::Lz4 => Ok(Self::Lz4),
            CompressionId::Zstd => Ok(Self::Zstd),
            CompressionId::Lzma | CompressionId::Lzo | CompressionId::Xz => {
                Err(BsqError::UnsupportedCompression(id.name().to_owned()))
            }
        }
    }
}

impl Decompressor for Codec {
    fn id(&self) -> Option<CompressionId> {
        match self {
            Self::Zlib => Some(CompressionId::Zlib),
            Self::Lz4 => Some(CompressionId::Lz4),
            Self::Zstd => Some(CompressionId::Zstd),
            Self::Identity => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Zlib => "gzip",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Identity => "identity",
        }
    }

    fn decompress(&self, raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
        let written = match self {
            Self::Zlib => inflate(raw, output)?,
            Self::Lz4 => unlz4(raw, output)?,
            Self::Zstd => unzstd(raw, output)?,
            Self::Identity => identity(raw, output)?,
        };
        trace!(codec = self.name(), input = raw.len(), written, "decompressed block");
        Ok(written)
    }
}

fn corrupt(codec: &'static str, detail: impl Into<String>) -> CodecError {
    CodecError::Corrupt {
        codec,
        detail: detail.into(),
    }
}

fn inflate(raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
    const CODEC: &str = "gzip";

    let mut stream = Decompress::new(true);
    let mut segments = raw.segments();
    let mut input: &[u8] = segments.next().unwrap_or_default();
    // Stands in for the output once the actor is full, so a stream whose
    // only remaining input is the checksum can still reach its end.
    let mut spare = [0_u8; 1];

    loop {
        let before_in = stream.total_in();
        let before_out = stream.total_out();
        let (status, full) = match output.current_page()? {
            Some(page) => (stream.decompress(input, page, FlushDecompress::None), false),
            None => (
                stream.decompress(input, &mut spare, FlushDecompress::None),
                true,
            ),
        };
        let status = status.map_err(|err| corrupt(CODEC, err.to_string()))?;
        let consumed = (stream.total_in() - before_in) as usize;
        let produced = (stream.total_out() - before_out) as usize;
        if full && produced > 0 {
            return Err(CodecError::Overflow {
                codec: CODEC,
                capacity: output.capacity(),
            });
        }
        output.advance(if full { 0 } else { produced });
        input = &input[consumed..];

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if input.is_empty() {
                    match segments.next() {
                        Some(next) => input = next,
                        None if produced == 0 => {
                            return Err(corrupt(CODEC, "stream ends before its end marker"));
                        }
                        None => {}
                    }
                } else if consumed == 0 && produced == 0 {
                    return Err(corrupt(CODEC, "inflate made no progress"));
                }
            }
        }
    }

    if !input.is_empty() || segments.any(|segment| !segment.is_empty()) {
        return Err(corrupt(CODEC, "trailing bytes after end of stream"));
    }
    Ok(output.finish())
}

fn unlz4(raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
    let input = raw.gather()?;
    let mut decoded = try_alloc_zeroed(output.remaining())?;
    let len = lz4_flex::block::decompress_into(&input, &mut decoded)
        .map_err(|err| corrupt("lz4", err.to_string()))?;
    emit("lz4", &decoded[..len], output)
}

fn unzstd(raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
    let input = raw.gather()?;
    let decoded = zstd::bulk::decompress(&input, output.remaining())
        .map_err(|err| corrupt("zstd", err.to_string()))?;
    emit("zstd", &decoded, output)
}

fn identity(raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
    let input = raw.gather()?;
    emit("identity", &input, output)
}

fn emit(codec: &'static str, decoded: &[u8], output: &mut PageActor) -> Result<usize, CodecError> {
    if decoded.len() > output.remaining() {
        return Err(CodecError::Overflow {
            codec,
            capacity: output.capacity(),
        });
    }
    output.write(decoded)?;
    Ok(output.finish())
}
