#![forbid(unsafe_code)]
//! Value types and on-disk constants for the compressed read-only image format.
//!
//! Pure crate: no I/O. Everything here is shared by the block layer, the
//! decompressors and the mounted-filesystem read path.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Image magic, `"hsqs"` read as a little-endian u32.
pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;
pub const SQUASHFS_MAGIC_BYTES: [u8; 4] = *b"hsqs";
pub const SUPERBLOCK_SIZE: usize = 96;

pub const SQUASHFS_MAJOR: u16 = 4;
pub const SQUASHFS_MINOR: u16 = 0;

/// Largest decoded metadata block.
pub const METADATA_SIZE: usize = 8192;
/// Largest data block the on-disk tool produces (1 MiB).
pub const MAX_DATA_BLOCK_SIZE: u32 = 1 << 20;
pub const MAX_DATA_BLOCK_LOG: u16 = 20;
pub const MIN_DATA_BLOCK_LOG: u16 = 12;

/// Device block size used by the firmware when nothing else is configured.
pub const DEFAULT_DEVICE_BLOCK_SIZE: u32 = 1024;

pub const PAGE_CACHE_SHIFT: u32 = 12;
pub const PAGE_CACHE_SIZE: usize = 1 << PAGE_CACHE_SHIFT;

/// Pages decoded at once for a single open file.
pub const WINDOW_PAGES: usize = 32;
pub const WINDOW_SIZE: usize = WINDOW_PAGES * PAGE_CACHE_SIZE;

/// Bit 15 of a metadata length word: set when the block is stored raw.
pub const METADATA_UNCOMPRESSED_BIT: u16 = 1 << 15;
/// Bit 24 of a data length word: set when the block is stored raw.
pub const DATA_UNCOMPRESSED_BIT: u32 = 1 << 24;

pub const FRAGMENT_ENTRY_SIZE: usize = 16;
/// Fragment table entries per metadata block.
pub const FRAGMENTS_PER_METADATA_BLOCK: usize = METADATA_SIZE / FRAGMENT_ENTRY_SIZE;

/// Sentinel fragment index meaning "this file has no tail fragment".
pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Byte offset on a `ByteDevice` (pread semantics).
///
/// Unit-carrying wrapper so bytes and device blocks are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Validated device block size: a power of two in `512..=65536`.
///
/// All device-block arithmetic goes through [`DeviceBlockSize::shift`] and
/// [`DeviceBlockSize::mask`]; nothing divides by the raw size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceBlockSize(u32);

impl DeviceBlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "device_block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Size in bytes as `usize` (always fits: at most 64 KiB).
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// log2 of the block size.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Mask selecting the offset within a device block.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    /// Device block containing `byte`.
    #[must_use]
    pub fn block_of(self, byte: u64) -> BlockNumber {
        BlockNumber(byte >> self.shift())
    }

    /// Offset of `byte` within its device block.
    #[must_use]
    pub fn offset_in_block(self, byte: u64) -> usize {
        // Masked value is below 65536.
        (byte & self.mask()) as usize
    }

    /// First byte of `block`.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<ByteOffset> {
        block.0.checked_shl(self.shift()).and_then(|byte| {
            // checked_shl only guards the shift amount; verify no bits were lost.
            (byte >> self.shift() == block.0).then_some(ByteOffset(byte))
        })
    }
}

/// Decoded metadata length word (16 bits, little-endian on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataLength {
    pub raw: u16,
}

impl MetadataLength {
    #[must_use]
    pub fn from_bytes(low: u8, high: u8) -> Self {
        Self {
            raw: u16::from_le_bytes([low, high]),
        }
    }

    /// Bit 15 clear means the block is compressed.
    #[must_use]
    pub fn compressed(self) -> bool {
        self.raw & METADATA_UNCOMPRESSED_BIT == 0
    }

    /// Stored size: the low 15 bits, with zero standing for `0x8000`.
    #[must_use]
    pub fn size(self) -> u32 {
        let size = self.raw & !METADATA_UNCOMPRESSED_BIT;
        if size == 0 {
            u32::from(METADATA_UNCOMPRESSED_BIT)
        } else {
            u32::from(size)
        }
    }
}

/// Decoded data block length word (32 bits, supplied by inode/fragment tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLength {
    pub raw: u32,
}

impl DataLength {
    #[must_use]
    pub fn new(raw: u32) -> Self {
        Self { raw }
    }

    /// Length word for a raw (uncompressed) block of `size` bytes.
    #[must_use]
    pub fn uncompressed(size: u32) -> Self {
        Self {
            raw: size | DATA_UNCOMPRESSED_BIT,
        }
    }

    /// Bit 24 clear means the block is compressed.
    #[must_use]
    pub fn compressed(self) -> bool {
        self.raw & DATA_UNCOMPRESSED_BIT == 0
    }

    #[must_use]
    pub fn size(self) -> u32 {
        self.raw & !DATA_UNCOMPRESSED_BIT
    }

    /// A zero length word marks a hole in a regular file.
    #[must_use]
    pub fn is_sparse(self) -> bool {
        self.raw == 0
    }
}

/// Location and encoding of one on-disk block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Byte index of the block. For a metadata block this is its length
    /// header; for a data block, its first payload byte.
    pub index: u64,
    pub on_disk_length: u32,
    pub compressed: bool,
}

/// Compression algorithm identifier stored in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionId {
    Zlib,
    Lzma,
    Lzo,
    Xz,
    Lz4,
    Zstd,
}

impl CompressionId {
    pub fn from_raw(raw: u16) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Lzma),
            3 => Ok(Self::Lzo),
            4 => Ok(Self::Xz),
            5 => Ok(Self::Lz4),
            6 => Ok(Self::Zstd),
            _ => Err(ParseError::InvalidField {
                field: "compression",
                reason: "unknown compression id",
            }),
        }
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        match self {
            Self::Zlib => 1,
            Self::Lzma => 2,
            Self::Lzo => 3,
            Self::Xz => 4,
            Self::Lz4 => 5,
            Self::Zstd => 6,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Zlib => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Window of decoded file data that byte position `pos` falls in.
#[must_use]
pub fn window_of(pos: u64) -> u64 {
    pos / WINDOW_SIZE as u64
}

/// Page index inside its window for byte position `pos`.
#[must_use]
pub fn page_in_window(pos: u64) -> usize {
    // Remainder is below WINDOW_SIZE.
    ((pos % WINDOW_SIZE as u64) as usize) / PAGE_CACHE_SIZE
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceBlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
