//! Metadata block length header decoding.
//!
//! Every metadata block is preceded by a 2-byte little-endian length word.
//! The word may straddle a device block boundary: when only one byte of the
//! current device block remains, the high byte is the first byte of the next
//! device block.

use crate::{BlockBuf, BlockDevice};
use asupersync::Cx;
use bsq_error::Result;
use bsq_types::{BlockNumber, MetadataLength};
use tracing::trace;

/// Decoded header plus the device block the payload starts in.
#[derive(Debug)]
pub struct LengthHeader {
    pub length: MetadataLength,
    /// Device block holding the first payload byte, already read.
    pub buf: BlockBuf,
    /// Number of the device block in `buf`.
    pub block: BlockNumber,
    /// Offset of the first payload byte inside `buf`.
    pub offset: usize,
}

/// Read the length word at `(block, offset)`.
///
/// Device read failures propagate unchanged; there is no retry here.
pub fn read_block_length(
    cx: &Cx,
    dev: &dyn BlockDevice,
    block: BlockNumber,
    offset: usize,
) -> Result<LengthHeader> {
    let block_size = dev.block_size().bytes();
    debug_assert!(offset < block_size, "offset {offset} outside device block");

    let first = dev.read_block(cx, block)?;
    let next_block = BlockNumber(block.0 + 1);

    if block_size - offset == 1 {
        let low = first.as_slice()[offset];
        drop(first);
        let second = dev.read_block(cx, next_block)?;
        let length = MetadataLength::from_bytes(low, second.as_slice()[0]);
        trace!(
            block = block.0,
            offset,
            raw = length.raw,
            "metadata length word straddles device blocks"
        );
        return Ok(LengthHeader {
            length,
            buf: second,
            block: next_block,
            offset: 1,
        });
    }

    let bytes = first.as_slice();
    let length = MetadataLength::from_bytes(bytes[offset], bytes[offset + 1]);
    let offset = offset + 2;
    if offset == block_size {
        drop(first);
        let second = dev.read_block(cx, next_block)?;
        return Ok(LengthHeader {
            length,
            buf: second,
            block: next_block,
            offset: 0,
        });
    }

    Ok(LengthHeader {
        length,
        buf: first,
        block,
        offset,
    })
}
