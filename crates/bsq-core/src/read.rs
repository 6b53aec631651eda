//! Block read path: fetch the device blocks of one logical block, then
//! decompress or copy them into a page actor.

use crate::SquashFs;
use asupersync::Cx;
use bsq_block::FetchedBlock;
use bsq_decompress::{Decompressor, PageActor, copy_uncompressed};
use bsq_error::{BsqError, Result};
use bsq_types::{DataLength, METADATA_SIZE};
use tracing::{trace, warn};

impl SquashFs {
    /// Read the data block at byte `index` whose length word came from an
    /// inode block list or the fragment table.
    ///
    /// Output is bounded by `output.capacity()`; a block whose on-disk or
    /// decoded size exceeds it fails. Returns the number of bytes produced.
    pub fn read_data(
        &self,
        cx: &Cx,
        index: u64,
        length: DataLength,
        output: &mut PageActor,
    ) -> Result<usize> {
        if length.is_sparse() {
            return Err(BsqError::InvalidArgument(format!(
                "block at byte {index} is sparse and has no on-disk data"
            )));
        }
        let fetched = self
            .fetcher()
            .fetch_data(cx, index, length, output.capacity())?;
        self.decode(&fetched, output)
    }

    /// Read the self-describing metadata block at byte `index`.
    ///
    /// Returns the decoded bytes (at most 8 KiB) and the byte index of the
    /// next metadata block in the chain.
    pub fn read_metadata_block(&self, cx: &Cx, index: u64) -> Result<(Vec<u8>, u64)> {
        let fetched = self.fetcher().fetch_metadata(cx, index, METADATA_SIZE)?;
        let mut output = PageActor::new(METADATA_SIZE);
        let len = self.decode(&fetched, &mut output)?;
        trace!(index, len, next = fetched.next_index, "read metadata block");
        Ok((output.to_vec()?, fetched.next_index))
    }

    /// Read a table of `len` bytes stored raw at `start`, such as the
    /// fragment index.
    pub fn read_table(&self, cx: &Cx, start: u64, len: usize) -> Result<Vec<u8>> {
        let size = u32::try_from(len)
            .ok()
            .filter(|&size| DataLength::uncompressed(size).size() == size)
            .ok_or_else(|| BsqError::InvalidArgument(format!("table length {len} too large")))?;
        let mut output = PageActor::new(len);
        let read = self.read_data(cx, start, DataLength::uncompressed(size), &mut output)?;
        if read != len {
            return Err(BsqError::CorruptLength {
                index: start,
                detail: format!("table read {read} of {len} bytes"),
            });
        }
        output.to_vec()
    }

    fn decode(&self, fetched: &FetchedBlock, output: &mut PageActor) -> Result<usize> {
        let index = fetched.descriptor.index;
        let decoded = if fetched.descriptor.compressed {
            self.codec().decompress(&fetched.raw, output)
        } else {
            copy_uncompressed(&fetched.raw, output)
        };
        decoded.map_err(|err| {
            let err = err.at_block(index);
            warn!(index, error = %err, "block decode failed");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{MountOptions, SquashFs};
    use asupersync::Cx;
    use bsq_block::MemoryByteDevice;
    use bsq_decompress::PageActor;
    use bsq_error::BsqError;
    use bsq_ondisk::{INVALID_TABLE, Superblock, SuperblockFlags};
    use bsq_types::{CompressionId, DataLength, SUPERBLOCK_SIZE};
    use std::io::Write;
    use std::sync::Arc;

    /// Image with a superblock and `payload` written at byte 96.
    fn mount_with(payload: &[u8]) -> SquashFs {
        let bytes_used = (SUPERBLOCK_SIZE + payload.len()) as u64;
        let sb = Superblock {
            inodes: 1,
            mkfs_time: 0,
            block_size: 4096,
            fragments: 0,
            compression: CompressionId::Zlib,
            block_log: 12,
            flags: SuperblockFlags(0),
            no_ids: 1,
            version_major: 4,
            version_minor: 0,
            root_inode: 0,
            bytes_used,
            id_table_start: INVALID_TABLE,
            xattr_table_start: INVALID_TABLE,
            inode_table_start: 96,
            directory_table_start: 96,
            fragment_table_start: INVALID_TABLE,
            lookup_table_start: INVALID_TABLE,
        };
        let mut image = sb.to_bytes().to_vec();
        image.extend_from_slice(payload);
        let options = MountOptions {
            device_block_size: 512,
            ..MountOptions::default()
        };
        SquashFs::mount(
            &Cx::for_testing(),
            Arc::new(MemoryByteDevice::new(image)),
            &options,
        )
        .expect("mount")
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        enc.write_all(data).expect("compress");
        enc.finish().expect("finish")
    }

    #[test]
    fn compressed_and_raw_data_blocks() {
        let cx = Cx::for_testing();
        let plain: Vec<u8> = (0..4096_u32).map(|i| (i / 3) as u8).collect();
        let packed = zlib(&plain);
        let mut payload = packed.clone();
        payload.extend_from_slice(&plain[..1000]);
        let fs = mount_with(&payload);

        let mut out = PageActor::new(4096);
        let n = fs
            .read_data(&cx, 96, DataLength::new(packed.len() as u32), &mut out)
            .expect("compressed");
        assert_eq!(n, 4096);
        assert_eq!(out.to_vec().expect("vec"), plain);

        let mut out = PageActor::new(4096);
        let raw_index = 96 + packed.len() as u64;
        let n = fs
            .read_data(&cx, raw_index, DataLength::uncompressed(1000), &mut out)
            .expect("raw");
        assert_eq!(n, 1000);
        assert_eq!(out.to_vec().expect("vec"), &plain[..1000]);
    }

    #[test]
    fn corrupt_stream_reports_block_index() {
        let cx = Cx::for_testing();
        let fs = mount_with(&[0xFF; 600]);
        let mut out = PageActor::new(4096);
        let err = fs
            .read_data(&cx, 100, DataLength::new(300), &mut out)
            .unwrap_err();
        assert!(matches!(err, BsqError::Decompression { index: 100, .. }));
    }

    #[test]
    fn sparse_word_is_not_readable() {
        let cx = Cx::for_testing();
        let fs = mount_with(&[0; 16]);
        let mut out = PageActor::new(4096);
        let err = fs
            .read_data(&cx, 96, DataLength::new(0), &mut out)
            .unwrap_err();
        assert!(matches!(err, BsqError::InvalidArgument(_)));
    }

    #[test]
    fn metadata_blocks_chain() {
        let cx = Cx::for_testing();
        let first: Vec<u8> = (0..8192_u32).map(|i| (i % 97) as u8).collect();
        let packed = zlib(&first);
        let mut payload = Vec::new();
        payload.extend_from_slice(&(packed.len() as u16).to_le_bytes());
        payload.extend_from_slice(&packed);
        payload.extend_from_slice(&(5_u16 | 0x8000).to_le_bytes());
        payload.extend_from_slice(b"tail!");
        let fs = mount_with(&payload);

        let (block, next) = fs.read_metadata_block(&cx, 96).expect("first");
        assert_eq!(block, first);
        assert_eq!(next, 96 + 2 + packed.len() as u64);

        let (block, next) = fs.read_metadata_block(&cx, next).expect("second");
        assert_eq!(block, b"tail!");
        assert_eq!(next, fs.params().bytes_used);
    }

    #[test]
    fn oversized_metadata_output_is_rejected() {
        let cx = Cx::for_testing();
        let big = vec![7_u8; 8193];
        let packed = zlib(&big);
        let mut payload = (packed.len() as u16).to_le_bytes().to_vec();
        payload.extend_from_slice(&packed);
        let fs = mount_with(&payload);

        let err = fs.read_metadata_block(&cx, 96).unwrap_err();
        assert!(matches!(err, BsqError::Decompression { index: 96, .. }));
    }

    #[test]
    fn raw_table_read() {
        let cx = Cx::for_testing();
        let mut payload = Vec::new();
        for ptr in [1_u64, 2, 3] {
            payload.extend_from_slice(&ptr.to_le_bytes());
        }
        let fs = mount_with(&payload);
        assert_eq!(fs.read_table(&cx, 96, 24).expect("table"), payload);

        let err = fs.read_table(&cx, 96, 25).unwrap_err();
        assert!(matches!(err, BsqError::CorruptLength { index: 96, .. }));
    }
}
