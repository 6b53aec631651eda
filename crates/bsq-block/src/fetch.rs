//! Fetching the device blocks that cover one logical block.

use crate::{BlockBuf, BlockDevice, RawBlockSet, read_block_length};
use asupersync::Cx;
use bsq_error::{BsqError, Result};
use bsq_types::{BlockDescriptor, BlockNumber, DataLength};
use tracing::{trace, warn};

/// Raw buffers of one block plus where the following block starts.
#[derive(Debug)]
pub struct FetchedBlock {
    pub raw: RawBlockSet,
    pub descriptor: BlockDescriptor,
    /// Byte index immediately after this block; the start of the next
    /// metadata block in a chain.
    pub next_index: u64,
}

/// Reads logical blocks from a device bounded by the image's `bytes_used`.
#[derive(Clone, Copy)]
pub struct BlockFetcher<'a> {
    dev: &'a dyn BlockDevice,
    bytes_used: u64,
}

impl std::fmt::Debug for BlockFetcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFetcher")
            .field("block_size", &self.dev.block_size())
            .field("bytes_used", &self.bytes_used)
            .finish_non_exhaustive()
    }
}

fn corrupt(index: u64, detail: String) -> BsqError {
    warn!(index, %detail, "rejecting block");
    BsqError::CorruptLength { index, detail }
}

/// Device errors only name the device block; log which logical block the
/// read was for before passing the error on.
fn fetch_failed(index: u64, err: BsqError) -> BsqError {
    if !matches!(err, BsqError::Cancelled) {
        warn!(index, error = %err, "block fetch failed");
    }
    err
}

impl<'a> BlockFetcher<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, bytes_used: u64) -> Self {
        Self { dev, bytes_used }
    }

    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    #[must_use]
    pub fn device(&self) -> &'a dyn BlockDevice {
        self.dev
    }

    /// Fetch a data block whose length word comes from an inode or fragment
    /// table. Bounds are checked before any device read.
    pub fn fetch_data(
        &self,
        cx: &Cx,
        index: u64,
        length: DataLength,
        capacity: usize,
    ) -> Result<FetchedBlock> {
        let size = length.size();
        let size_bytes = usize::try_from(size)
            .map_err(|_| corrupt(index, format!("length {size} does not fit usize")))?;
        if size_bytes > capacity {
            return Err(corrupt(
                index,
                format!("length {size} exceeds output capacity {capacity}"),
            ));
        }
        let end = index
            .checked_add(u64::from(size))
            .ok_or_else(|| corrupt(index, format!("length {size} overflows the image")))?;
        if end > self.bytes_used {
            return Err(corrupt(
                index,
                format!("block end {end} exceeds bytes_used {}", self.bytes_used),
            ));
        }

        let block_size = self.dev.block_size();
        let offset = block_size.offset_in_block(index);
        let first = block_size.block_of(index);
        trace!(
            index,
            size,
            compressed = length.compressed(),
            capacity,
            "fetching data block"
        );

        let count = (offset + size_bytes).div_ceil(block_size.bytes());
        let bufs = self
            .read_run(cx, first, count, Vec::new())
            .map_err(|err| fetch_failed(index, err))?;
        let raw = RawBlockSet::new(bufs, offset, size_bytes)?;
        Ok(FetchedBlock {
            raw,
            descriptor: BlockDescriptor {
                index,
                on_disk_length: size,
                compressed: length.compressed(),
            },
            next_index: end,
        })
    }

    /// Fetch a self-describing metadata block starting at its length header.
    pub fn fetch_metadata(&self, cx: &Cx, index: u64, capacity: usize) -> Result<FetchedBlock> {
        let header_end = index
            .checked_add(2)
            .ok_or_else(|| corrupt(index, "header overflows the image".to_owned()))?;
        if header_end > self.bytes_used {
            return Err(corrupt(
                index,
                format!("length header ends past bytes_used {}", self.bytes_used),
            ));
        }

        let block_size = self.dev.block_size();
        let header = read_block_length(
            cx,
            self.dev,
            block_size.block_of(index),
            block_size.offset_in_block(index),
        )
        .map_err(|err| fetch_failed(index, err))?;
        let size = header.length.size();
        let compressed = header.length.compressed();
        let size_bytes = size as usize;
        if size_bytes > capacity {
            return Err(corrupt(
                index,
                format!("metadata length {size} exceeds output capacity {capacity}"),
            ));
        }
        let end = header_end.saturating_add(u64::from(size));
        if end > self.bytes_used {
            return Err(corrupt(
                index,
                format!("metadata block end {end} exceeds bytes_used {}", self.bytes_used),
            ));
        }
        trace!(index, size, compressed, "fetching metadata block");

        let offset = header.offset;
        let available = block_size.bytes() - offset;
        let extra = size_bytes.saturating_sub(available).div_ceil(block_size.bytes());
        let mut bufs = Vec::new();
        bufs.try_reserve_exact(extra + 1)
            .map_err(|_| BsqError::OutOfMemory)?;
        bufs.push(header.buf);
        let bufs = self
            .read_run(cx, BlockNumber(header.block.0 + 1), extra, bufs)
            .map_err(|err| fetch_failed(index, err))?;
        let raw = RawBlockSet::new(bufs, offset, size_bytes)?;
        Ok(FetchedBlock {
            raw,
            descriptor: BlockDescriptor {
                index,
                on_disk_length: size,
                compressed,
            },
            next_index: end,
        })
    }

    /// Append `count` consecutive device blocks starting at `first` to `bufs`.
    ///
    /// On failure `bufs` is dropped together with every block read so far.
    fn read_run(
        &self,
        cx: &Cx,
        first: BlockNumber,
        count: usize,
        mut bufs: Vec<BlockBuf>,
    ) -> Result<Vec<BlockBuf>> {
        bufs.try_reserve_exact(count)
            .map_err(|_| BsqError::OutOfMemory)?;
        for i in 0..count as u64 {
            bufs.push(self.dev.read_block(cx, BlockNumber(first.0 + i))?);
        }
        Ok(bufs)
    }
}
