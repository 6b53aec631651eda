#![forbid(unsafe_code)]
//! Block decoding into page-granular output.
//!
//! A fetched [`RawBlockSet`] is turned into bytes in a [`PageActor`] either
//! by a [`Codec`] (compressed blocks) or by [`copy_uncompressed`] (raw
//! blocks). Both paths stop at the actor's capacity and report the number of
//! bytes produced.

mod actor;
mod codec;
mod copy;

pub use actor::{Page, PageActor, alloc_page};
pub use codec::Codec;
pub use copy::copy_uncompressed;

use bsq_block::RawBlockSet;
use bsq_error::BsqError;
use bsq_types::CompressionId;
use thiserror::Error;

/// Failure while decoding one block.
///
/// Codecs never see the block's byte index; callers attach it with
/// [`CodecError::at_block`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec}: {detail}")]
    Corrupt { codec: &'static str, detail: String },

    #[error("{codec}: output exceeds capacity of {capacity} bytes")]
    Overflow { codec: &'static str, capacity: usize },

    /// Allocation or other runtime failure passed through unchanged.
    #[error(transparent)]
    Runtime(#[from] BsqError),
}

impl CodecError {
    /// Convert to the runtime error for the block at byte `index`.
    #[must_use]
    pub fn at_block(self, index: u64) -> BsqError {
        match self {
            Self::Runtime(err) => err,
            other => BsqError::Decompression {
                index,
                detail: other.to_string(),
            },
        }
    }
}

/// A block decompressor.
pub trait Decompressor {
    /// Superblock compression id, if the codec has one.
    fn id(&self) -> Option<CompressionId>;

    fn name(&self) -> &'static str;

    /// Decode the compressed payload of `raw` into `output`, returning the
    /// decompressed length.
    ///
    /// Fails if the stream is corrupt or would exceed `output.capacity()`.
    fn decompress(&self, raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError>;
}
