//! Reads that span chained metadata blocks, and fragment table lookups.

use crate::{SquashFs, parse_error_to_bsq};
use asupersync::Cx;
use bsq_error::{BsqError, Result};
use bsq_ondisk::{FragmentEntry, fragment_entry_offset, fragment_index_slot};
use bsq_types::FRAGMENT_ENTRY_SIZE;
use serde::{Deserialize, Serialize};

/// Position inside a chain of metadata blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCursor {
    /// Byte index of the current metadata block's length header.
    pub block: u64,
    /// Offset into the decoded bytes of that block.
    pub offset: usize,
}

impl MetadataCursor {
    #[must_use]
    pub fn new(block: u64, offset: usize) -> Self {
        Self { block, offset }
    }
}

impl SquashFs {
    /// Read `len` bytes starting at `cursor`, following the chain into as
    /// many metadata blocks as needed. The cursor is left just past the
    /// bytes read.
    pub fn read_metadata(
        &self,
        cx: &Cx,
        cursor: &mut MetadataCursor,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(len)
            .map_err(|_| BsqError::OutOfMemory)?;

        while out.len() < len {
            let (block, next) = self.read_metadata_block(cx, cursor.block)?;
            if cursor.offset > block.len() {
                return Err(BsqError::CorruptLength {
                    index: cursor.block,
                    detail: format!(
                        "offset {} past decoded length {}",
                        cursor.offset,
                        block.len()
                    ),
                });
            }
            let take = (len - out.len()).min(block.len() - cursor.offset);
            out.extend_from_slice(&block[cursor.offset..cursor.offset + take]);
            cursor.offset += take;
            if cursor.offset == block.len() {
                cursor.block = next;
                cursor.offset = 0;
            }
        }
        Ok(out)
    }

    /// Look up fragment `fragment` in the fragment table.
    pub fn fragment_entry(&self, cx: &Cx, fragment: u32) -> Result<FragmentEntry> {
        if fragment >= self.params.fragments {
            return Err(BsqError::Format(format!(
                "fragment {fragment} out of range ({} fragments)",
                self.params.fragments
            )));
        }
        let block = self
            .fragment_index
            .get(fragment_index_slot(fragment))
            .copied()
            .ok_or_else(|| {
                BsqError::Format(format!("fragment {fragment} has no index entry"))
            })?;
        let mut cursor = MetadataCursor::new(block, fragment_entry_offset(fragment));
        let bytes = self.read_metadata(cx, &mut cursor, FRAGMENT_ENTRY_SIZE)?;
        FragmentEntry::parse(&bytes).map_err(|e| parse_error_to_bsq(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MountOptions;
    use bsq_block::MemoryByteDevice;
    use bsq_ondisk::{INVALID_TABLE, Superblock, SuperblockFlags};
    use bsq_types::{CompressionId, DataLength, SUPERBLOCK_SIZE};
    use std::sync::Arc;

    fn raw_metadata(data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u16 | 0x8000).to_le_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    /// Image: superblock, two raw metadata blocks of fragment entries, then
    /// the fragment index pointing at them.
    fn image_with_fragments(count: u32) -> (Vec<u8>, Vec<FragmentEntry>) {
        let entries: Vec<FragmentEntry> = (0..count)
            .map(|i| FragmentEntry {
                start_block: 10_000 + u64::from(i) * 100,
                size: DataLength::new(50 + i),
            })
            .collect();

        let mut image = vec![0_u8; SUPERBLOCK_SIZE];
        let mut pointers = Vec::new();
        for chunk in entries.chunks(512) {
            pointers.push(image.len() as u64);
            let bytes: Vec<u8> = chunk.iter().flat_map(FragmentEntry::to_bytes).collect();
            image.extend_from_slice(&raw_metadata(&bytes));
        }
        let table_start = image.len() as u64;
        for ptr in &pointers {
            image.extend_from_slice(&ptr.to_le_bytes());
        }

        let sb = Superblock {
            inodes: 1,
            mkfs_time: 0,
            block_size: 4096,
            fragments: count,
            compression: CompressionId::Zlib,
            block_log: 12,
            flags: SuperblockFlags(0),
            no_ids: 1,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used: image.len() as u64,
            id_table_start: INVALID_TABLE,
            xattr_table_start: INVALID_TABLE,
            inode_table_start: 96,
            directory_table_start: 96,
            fragment_table_start: table_start,
            lookup_table_start: INVALID_TABLE,
        };
        image[..SUPERBLOCK_SIZE].copy_from_slice(&sb.to_bytes());
        (image, entries)
    }

    fn mount(image: Vec<u8>) -> SquashFs {
        SquashFs::mount(
            &Cx::for_testing(),
            Arc::new(MemoryByteDevice::new(image)),
            &MountOptions::default(),
        )
        .expect("mount")
    }

    #[test]
    fn fragment_lookup_across_two_table_blocks() {
        let cx = Cx::for_testing();
        let (image, entries) = image_with_fragments(600);
        let fs = mount(image);
        assert_eq!(fs.fragment_index().len(), 2);

        for n in [0_u32, 1, 511, 512, 599] {
            let entry = fs.fragment_entry(&cx, n).expect("entry");
            assert_eq!(entry, entries[n as usize], "fragment {n}");
        }
        assert!(matches!(
            fs.fragment_entry(&cx, 600).unwrap_err(),
            BsqError::Format(_)
        ));
    }

    #[test]
    fn read_spans_chained_blocks() {
        let cx = Cx::for_testing();
        let (image, entries) = image_with_fragments(600);
        let fs = mount(image);

        // Entries 510..514 straddle the two metadata blocks.
        let mut cursor = MetadataCursor::new(fs.fragment_index()[0], 510 * 16);
        let bytes = fs.read_metadata(&cx, &mut cursor, 4 * 16).expect("read");
        let expected: Vec<u8> = entries[510..514]
            .iter()
            .flat_map(FragmentEntry::to_bytes)
            .collect();
        assert_eq!(bytes, expected);
        assert_eq!(cursor, MetadataCursor::new(fs.fragment_index()[1], 2 * 16));
    }

    #[test]
    fn cursor_past_block_end_is_corruption() {
        let cx = Cx::for_testing();
        let (image, _) = image_with_fragments(3);
        let fs = mount(image);
        let mut cursor = MetadataCursor::new(fs.fragment_index()[0], 49);
        let err = fs.read_metadata(&cx, &mut cursor, 1).unwrap_err();
        assert!(matches!(err, BsqError::CorruptLength { .. }));
    }

    #[test]
    fn fragment_index_pointing_forward_fails_mount() {
        let (mut image, _) = image_with_fragments(3);
        let table_start = image.len() - 8;
        let bogus = (image.len() as u64).to_le_bytes();
        image[table_start..].copy_from_slice(&bogus);
        let err = SquashFs::mount(
            &Cx::for_testing(),
            Arc::new(MemoryByteDevice::new(image)),
            &MountOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BsqError::Format(_)));
    }
}
