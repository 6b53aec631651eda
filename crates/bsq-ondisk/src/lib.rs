#![forbid(unsafe_code)]
//! On-disk format parsing for BootSquash images.
//!
//! Pure parsing crate with no I/O: superblock, image type detection and
//! fragment table entries.

pub mod superblock;
pub mod table;

pub use superblock::{INVALID_TABLE, Superblock, SuperblockFlags};
pub use table::{
    FragmentEntry, fragment_entry_offset, fragment_index_bytes, fragment_index_slot,
    parse_pointer_table,
};

use bsq_types::SQUASHFS_MAGIC_BYTES;
use serde::{Deserialize, Serialize};

/// Image type recognised from the first bytes of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    Squashfs,
    Unknown,
}

/// Minimum number of bytes inspected before anything is recognised.
pub const DETECT_MIN_BYTES: usize = 16;

/// Classify a buffer by its magic. Buffers shorter than
/// [`DETECT_MIN_BYTES`] are always `Unknown`.
#[must_use]
pub fn detect_image_type(buf: &[u8]) -> ImageType {
    if buf.len() < DETECT_MIN_BYTES {
        return ImageType::Unknown;
    }
    if buf[..4] == SQUASHFS_MAGIC_BYTES {
        ImageType::Squashfs
    } else {
        ImageType::Unknown
    }
}
