#![forbid(unsafe_code)]
//! Device block I/O for the compressed image reader.
//!
//! Provides the `ByteDevice`/`BlockDevice` traits with `&Cx` capability
//! context for cooperative cancellation, the owned scatter buffer set
//! ([`RawBlockSet`]) handed to decompressors, the metadata length header
//! decoder ([`read_block_length`]) and the [`BlockFetcher`] that turns a
//! `(byte index, length)` pair into the device blocks covering it.

mod fetch;
mod length;

pub use fetch::{BlockFetcher, FetchedBlock};
pub use length::{LengthHeader, read_block_length};

use asupersync::Cx;
use bsq_error::{BsqError, Result};
use bsq_types::{BlockNumber, ByteOffset, DeviceBlockSize};
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| BsqError::Cancelled)
}

/// Owned device block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
pub fn try_alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| BsqError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Byte-addressed read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(cx, offset, buf)
    }
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| BsqError::Format("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| BsqError::Format("read range overflows u64".to_owned()))?;
    if end.0 > device_len {
        return Err(BsqError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style positioned reads.
///
/// Uses `std::os::unix::fs::FileExt`, which does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        cx_checkpoint(cx)?;
        Ok(())
    }
}

/// Image held in memory, e.g. loaded into RAM by an earlier boot stage.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, cx: &Cx, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len_bytes())?;
        // check_range bounded offset + len by a usize-sized slice length.
        let start = offset.0 as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Block-addressed read interface: one device block per call.
pub trait BlockDevice: Send + Sync {
    /// Read a device block by number.
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size.
    fn block_size(&self) -> DeviceBlockSize;

    /// Total number of device blocks (a partial tail block counts).
    fn block_count(&self) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(cx, block)
    }

    fn block_size(&self) -> DeviceBlockSize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}

/// Read counters for a block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: u64,
    pub bytes_read: u64,
    pub failures: u64,
}

/// Adapts a [`ByteDevice`] to fixed-size device blocks.
///
/// Images are not required to be a multiple of the device block size; the
/// final partial block is returned zero-padded.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: DeviceBlockSize,
    block_count: u64,
    len: u64,
    stats: Mutex<DeviceStats>,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        let block_size = DeviceBlockSize::new(block_size).map_err(|_| {
            BsqError::Format(format!(
                "invalid device block size {block_size} (must be power of two in 512..=65536)"
            ))
        })?;

        let len = inner.len_bytes();
        let block_count = len.div_ceil(u64::from(block_size.get()));
        Ok(Self {
            inner,
            block_size,
            block_count,
            len,
            stats: Mutex::new(DeviceStats::default()),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        if block.0 >= self.block_count {
            self.stats.lock().failures += 1;
            return Err(BsqError::DeviceRead {
                block: block.0,
                detail: format!("beyond end of device ({} blocks)", self.block_count),
            });
        }

        let offset = self.block_size.block_to_byte(block).ok_or_else(|| {
            BsqError::DeviceRead {
                block: block.0,
                detail: "block offset overflows u64".to_owned(),
            }
        })?;
        let mut buf = try_alloc_zeroed(self.block_size.bytes())?;
        // Only the bytes that exist on the device are read; the tail of a
        // partial last block stays zero.
        let available = usize::try_from(self.len - offset.0)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        match self.inner.read_exact_at(cx, offset, &mut buf[..available]) {
            Ok(()) => {}
            Err(BsqError::Cancelled) => return Err(BsqError::Cancelled),
            Err(err) => {
                self.stats.lock().failures += 1;
                return Err(BsqError::DeviceRead {
                    block: block.0,
                    detail: err.to_string(),
                });
            }
        }
        cx_checkpoint(cx)?;

        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += available as u64;
        drop(stats);
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> DeviceBlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Device blocks fetched for one logical block.
///
/// The payload starts `offset` bytes into the first buffer and runs for
/// `length` bytes across the buffers in order. Buffers are owned; dropping
/// the set releases them on every path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlockSet {
    bufs: Vec<BlockBuf>,
    offset: usize,
    length: usize,
}

impl RawBlockSet {
    /// Build a set, checking that the buffers cover `offset + length` bytes.
    pub fn new(bufs: Vec<BlockBuf>, offset: usize, length: usize) -> Result<Self> {
        let covered: usize = bufs.iter().map(BlockBuf::len).sum();
        let needed = offset
            .checked_add(length)
            .ok_or_else(|| BsqError::InvalidArgument("raw block range overflows".to_owned()))?;
        if needed > covered {
            return Err(BsqError::InvalidArgument(format!(
                "raw buffers cover {covered} bytes, need {needed}"
            )));
        }
        if length > 0 && bufs.first().is_some_and(|buf| offset >= buf.len()) {
            return Err(BsqError::InvalidArgument(format!(
                "offset {offset} lies past the first buffer"
            )));
        }
        Ok(Self {
            bufs,
            offset,
            length,
        })
    }

    /// Split `bytes` into `block_size` chunks with the payload at `offset`.
    ///
    /// Convenience for callers that already hold a contiguous copy.
    pub fn from_contiguous(bytes: &[u8], block_size: usize, offset: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(BsqError::InvalidArgument("block_size must be non-zero".to_owned()));
        }
        let mut padded = try_alloc_zeroed(offset + bytes.len())?;
        padded[offset..].copy_from_slice(bytes);
        let bufs = padded
            .chunks(block_size)
            .map(|chunk| {
                let mut buf = chunk.to_vec();
                buf.resize(block_size, 0);
                BlockBuf::new(buf)
            })
            .collect();
        Self::new(bufs, offset, bytes.len())
    }

    #[must_use]
    pub fn buffers(&self) -> &[BlockBuf] {
        &self.bufs
    }

    /// Offset of the payload inside the first buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Logical payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The payload as an ordered sequence of non-empty slices, one per buffer.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut skip = self.offset;
        let mut remaining = self.length;
        self.bufs.iter().map_while(move |buf| {
            if remaining == 0 {
                return None;
            }
            let bytes = buf.as_slice();
            let start = skip.min(bytes.len());
            skip = 0;
            let take = (bytes.len() - start).min(remaining);
            remaining -= take;
            Some(&bytes[start..start + take])
        })
    }

    /// Copy the payload into one contiguous buffer.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(self.length)
            .map_err(|_| BsqError::OutOfMemory)?;
        for segment in self.segments() {
            out.extend_from_slice(segment);
        }
        Ok(out)
    }
}
