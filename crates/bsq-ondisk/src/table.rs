//! Fragment table entries and index arithmetic.
//!
//! The fragment table is a list of 16-byte entries packed into metadata
//! blocks. An index of little-endian `u64` pointers, stored at
//! `fragment_table_start`, gives the start of each of those metadata blocks.

use bsq_types::{
    DataLength, FRAGMENT_ENTRY_SIZE, FRAGMENTS_PER_METADATA_BLOCK, ParseError, read_le_u32,
    read_le_u64,
};
use serde::{Deserialize, Serialize};

/// One fragment block: where it starts and its data length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentEntry {
    pub start_block: u64,
    pub size: DataLength,
}

impl FragmentEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_le_u64(bytes, 0)?,
            size: DataLength::new(read_le_u32(bytes, 8)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAGMENT_ENTRY_SIZE] {
        let mut out = [0_u8; FRAGMENT_ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.start_block.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.raw.to_le_bytes());
        out
    }
}

/// Slot of the index table pointing at the metadata block holding fragment
/// `fragment`.
#[must_use]
pub fn fragment_index_slot(fragment: u32) -> usize {
    fragment as usize / FRAGMENTS_PER_METADATA_BLOCK
}

/// Byte offset of fragment `fragment` within its metadata block.
#[must_use]
pub fn fragment_entry_offset(fragment: u32) -> usize {
    (fragment as usize % FRAGMENTS_PER_METADATA_BLOCK) * FRAGMENT_ENTRY_SIZE
}

/// Size in bytes of the pointer index for `fragments` entries.
#[must_use]
pub fn fragment_index_bytes(fragments: u32) -> usize {
    (fragments as usize).div_ceil(FRAGMENTS_PER_METADATA_BLOCK) * 8
}

/// Decode a table of little-endian `u64` block pointers.
pub fn parse_pointer_table(bytes: &[u8]) -> Result<Vec<u64>, ParseError> {
    if bytes.len() % 8 != 0 {
        return Err(ParseError::InvalidField {
            field: "pointer_table",
            reason: "length not a multiple of 8",
        });
    }
    (0..bytes.len() / 8)
        .map(|i| read_le_u64(bytes, i * 8))
        .collect()
}
