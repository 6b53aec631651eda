#![forbid(unsafe_code)]
//! Mounted BootSquash image.
//!
//! [`SquashFs`] binds a byte device, the parameters derived from its
//! superblock and the codec chosen at mount. On top of it sit the block read
//! path ([`SquashFs::read_data`], [`SquashFs::read_metadata_block`]), chained
//! metadata and table reads, and windowed file reads through
//! [`SquashFs::open`].

mod file;
mod metadata;
mod read;

pub use file::{
    BlockLocation, FileHandle, FileLayout, FileReadWindow, FragmentRef, RegularFileLayout,
    WindowState,
};
pub use metadata::MetadataCursor;

pub use bsq_block::{ByteDevice, DeviceStats, FileByteDevice, MemoryByteDevice};
pub use bsq_decompress::{Codec, Decompressor, PageActor};
pub use bsq_error::{BsqError, Result};
pub use bsq_ondisk::{FragmentEntry, ImageType, Superblock, SuperblockFlags};
pub use bsq_types::{
    CompressionId, DEFAULT_DEVICE_BLOCK_SIZE, DataLength, PAGE_CACHE_SIZE, WINDOW_PAGES,
    WINDOW_SIZE,
};

use asupersync::Cx;
use bsq_block::{BlockDevice, BlockFetcher, ByteBlockDevice};
use bsq_ondisk::{detect_image_type, fragment_index_bytes, parse_pointer_table};
use bsq_types::{ByteOffset, DeviceBlockSize, ParseError, SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("image does not carry a squashfs superblock")]
    UnsupportedImage,
    #[error("I/O error while probing image: {0}")]
    Io(#[from] BsqError),
}

/// Parse the superblock at the start of an in-memory image.
pub fn detect_image(image: &[u8]) -> std::result::Result<Superblock, DetectionError> {
    if detect_image_type(image) != ImageType::Squashfs {
        return Err(DetectionError::UnsupportedImage);
    }
    Superblock::parse(image).map_err(|e| DetectionError::Io(parse_error_to_bsq(&e)))
}

/// Probe a device for a squashfs superblock.
pub fn detect_image_on_device(
    cx: &Cx,
    dev: &dyn ByteDevice,
) -> std::result::Result<Superblock, DetectionError> {
    let region = read_superblock_region(cx, dev)?;
    detect_image(&region)
}

pub fn detect_image_at_path(
    cx: &Cx,
    path: impl AsRef<Path>,
) -> std::result::Result<Superblock, DetectionError> {
    let dev = FileByteDevice::open(path)?;
    detect_image_on_device(cx, &dev)
}

/// Read the superblock region (96 bytes) from the start of a device.
pub fn read_superblock_region(cx: &Cx, dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    if dev.len_bytes() < SUPERBLOCK_SIZE as u64 {
        return Err(BsqError::Format(format!(
            "image of {} bytes is smaller than a superblock",
            dev.len_bytes()
        )));
    }
    let mut region = vec![0_u8; SUPERBLOCK_SIZE];
    dev.read_exact_at(cx, ByteOffset::ZERO, &mut region)?;
    Ok(region)
}

/// Convert a `ParseError` raised while reading image structures.
fn parse_error_to_bsq(e: &ParseError) -> BsqError {
    match e {
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => {
            BsqError::Format(e.to_string())
        }
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            BsqError::Parse(e.to_string())
        }
    }
}

/// Options controlling how an image is mounted.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Device block size used for all reads. Power of two in `512..=65536`.
    pub device_block_size: u32,
    /// Skip the mount-time cross checks (image length, fragment index).
    ///
    /// The superblock itself is always parsed strictly; this only relaxes
    /// checks against the device. Use for diagnostics only.
    pub skip_validation: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            device_block_size: DEFAULT_DEVICE_BLOCK_SIZE,
            skip_validation: false,
        }
    }
}

/// Read-path parameters fixed at mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemParameters {
    pub device_block_size: DeviceBlockSize,
    /// Bytes of the image in use; every block must end at or before this.
    pub bytes_used: u64,
    /// Data block size in bytes.
    pub block_size: u32,
    pub block_log: u16,
    pub fragment_table_start: u64,
    pub fragments: u32,
    pub codec: Codec,
}

impl FilesystemParameters {
    /// Derive mount parameters and bind the codec.
    ///
    /// Fails with `UnsupportedCompression` for codecs this build cannot
    /// decode, so no block is ever handed to an unknown decompressor.
    pub fn from_superblock(sb: &Superblock, device_block_size: u32) -> Result<Self> {
        let device_block_size = DeviceBlockSize::new(device_block_size).map_err(|_| {
            BsqError::Format(format!(
                "invalid device block size {device_block_size} (must be power of two in 512..=65536)"
            ))
        })?;
        let codec = Codec::for_id(sb.compression)?;
        Ok(Self {
            device_block_size,
            bytes_used: sb.bytes_used,
            block_size: sb.block_size,
            block_log: sb.block_log,
            fragment_table_start: sb.fragment_table_start,
            fragments: if sb.has_fragments() { sb.fragments } else { 0 },
            codec,
        })
    }

    /// `log2` of the device block size.
    #[must_use]
    pub fn device_block_shift(&self) -> u32 {
        self.device_block_size.shift()
    }
}

/// Summary of a mounted image, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub superblock: Superblock,
    pub device_len: u64,
    pub device_block_size: u32,
    pub fragment_index: Vec<u64>,
}

/// A mounted image, ready for block and file reads.
///
/// ```ignore
/// let cx = Cx::for_request();
/// let fs = SquashFs::open_path(&cx, "/boot/root.squashfs", &MountOptions::default())?;
/// let (bytes, next) = fs.read_metadata_block(&cx, fs.superblock().inode_table_start)?;
/// ```
pub struct SquashFs {
    superblock: Superblock,
    params: FilesystemParameters,
    /// Start of each fragment table metadata block.
    fragment_index: Vec<u64>,
    dev: ByteBlockDevice<Arc<dyn ByteDevice>>,
}

impl std::fmt::Debug for SquashFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquashFs")
            .field("params", &self.params)
            .field("fragment_index", &self.fragment_index)
            .field("dev_len", &self.dev.inner().len_bytes())
            .finish_non_exhaustive()
    }
}

impl SquashFs {
    /// Mount the image file at `path`.
    pub fn open_path(cx: &Cx, path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::mount(cx, Arc::new(dev), options)
    }

    /// Mount an already-opened device.
    pub fn mount(cx: &Cx, dev: Arc<dyn ByteDevice>, options: &MountOptions) -> Result<Self> {
        let superblock = detect_image_on_device(cx, &*dev).map_err(|e| match e {
            DetectionError::UnsupportedImage => {
                BsqError::Format("image is not a squashfs filesystem".into())
            }
            DetectionError::Io(err) => err,
        })?;
        let params = FilesystemParameters::from_superblock(&superblock, options.device_block_size)?;

        let device_len = dev.len_bytes();
        if !options.skip_validation && params.bytes_used > device_len {
            return Err(BsqError::Format(format!(
                "bytes_used {} exceeds device length {device_len}",
                params.bytes_used
            )));
        }

        let dev = ByteBlockDevice::new(dev, options.device_block_size)?;
        let mut fs = Self {
            superblock,
            params,
            fragment_index: Vec::new(),
            dev,
        };
        fs.fragment_index = fs.load_fragment_index(cx, options)?;

        debug!(
            compression = %fs.superblock.compression,
            block_size = fs.params.block_size,
            device_block_size = fs.params.device_block_size.get(),
            bytes_used = fs.params.bytes_used,
            fragments = fs.params.fragments,
            "mounted image"
        );
        Ok(fs)
    }

    fn load_fragment_index(&self, cx: &Cx, options: &MountOptions) -> Result<Vec<u64>> {
        if self.params.fragments == 0 {
            return Ok(Vec::new());
        }
        let len = fragment_index_bytes(self.params.fragments);
        let table = self.read_table(cx, self.params.fragment_table_start, len)?;
        let index = parse_pointer_table(&table).map_err(|e| parse_error_to_bsq(&e))?;
        // Fragment metadata blocks are written before their index.
        if !options.skip_validation
            && index
                .first()
                .is_some_and(|&first| first >= self.params.fragment_table_start)
        {
            warn!(
                fragment_table_start = self.params.fragment_table_start,
                "fragment index points past its own table"
            );
            return Err(BsqError::Format(
                "fragment index points past the fragment table".into(),
            ));
        }
        Ok(index)
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn params(&self) -> &FilesystemParameters {
        &self.params
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        self.params.codec
    }

    #[must_use]
    pub fn fragment_index(&self) -> &[u64] {
        &self.fragment_index
    }

    /// Read counters of the underlying block device.
    #[must_use]
    pub fn device_stats(&self) -> DeviceStats {
        self.dev.stats()
    }

    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.dev.inner().len_bytes()
    }

    #[must_use]
    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            superblock: self.superblock.clone(),
            device_len: self.device_len(),
            device_block_size: self.dev.block_size().get(),
            fragment_index: self.fragment_index.clone(),
        }
    }

    fn fetcher(&self) -> BlockFetcher<'_> {
        BlockFetcher::new(&self.dev, self.params.bytes_used)
    }
}
