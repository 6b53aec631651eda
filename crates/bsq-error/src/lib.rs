#![forbid(unsafe_code)]
//! Error types for BootSquash.
//!
//! # Error Taxonomy
//!
//! BootSquash uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bsq-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `BsqError` | `bsq-error` (this crate) | Errors surfaced by block reads, decompression and file reads |
//!
//! `bsq-error` does not depend on `bsq-types`; the `ParseError` → `BsqError`
//! conversion lives in `bsq-core`, which sees both.
//!
//! ## Read-path errors
//!
//! A block read can fail in four ways, each aborting the read with every
//! fetched device buffer already released:
//!
//! | Failure | Variant | errno |
//! |---------|---------|-------|
//! | Backing store read failed | `DeviceRead` | `EIO` |
//! | Length word out of range (capacity or `bytes_used`) | `CorruptLength` | `EIO` |
//! | Codec rejected the stream or overflowed its output | `Decompression` | `EIO` |
//! | Buffer allocation failed | `OutOfMemory` | `ENOMEM` |
//!
//! None of these are retried: a corrupt image must fail loudly instead of
//! returning wrong bytes.
//!
//! ## errno mapping
//!
//! [`BsqError::to_errno`] is exhaustive (no wildcard arm), so a new variant
//! does not compile until its errno is chosen.

use thiserror::Error;

/// Unified error type for all BootSquash operations.
#[derive(Debug, Error)]
pub enum BsqError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading a device block from the backing store failed.
    #[error("device read failed at block {block}: {detail}")]
    DeviceRead { block: u64, detail: String },

    /// A block length is negative, exceeds the output capacity, or reaches
    /// past `bytes_used`. `index` is the byte index of the offending block.
    #[error("corrupt block length at byte {index}: {detail}")]
    CorruptLength { index: u64, detail: String },

    /// The codec rejected the compressed stream of the block at `index`.
    #[error("decompression failed for block at byte {index}: {detail}")]
    Decompression { index: u64, detail: String },

    /// Allocation of a device buffer or output page failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The image uses a compressor this build cannot decode.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// The image's data block size cannot be served by the read window.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// Invalid on-disk format detected at mount (bad magic, version, geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    ///
    /// Carries the string form of a `ParseError` from `bsq-types`. Prefer
    /// `Format` at mount time and `CorruptLength` when a block index is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation cancelled via the `Cx` capability.
    #[error("operation cancelled")]
    Cancelled,

    /// Caller passed an argument that cannot name valid data.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BsqError {
    /// Convert this error into a POSIX errno for the firmware's file layer.
    ///
    /// - `DeviceRead`/`CorruptLength`/`Decompression` → `EIO`: the file read
    ///   fails, the image is not trusted.
    /// - `UnsupportedCompression`/`UnsupportedBlockSize` → `EOPNOTSUPP`.
    /// - `Cancelled` → `EINTR`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::DeviceRead { .. } | Self::CorruptLength { .. } | Self::Decompression { .. } => {
                libc::EIO
            }
            Self::OutOfMemory => libc::ENOMEM,
            Self::UnsupportedCompression(_) | Self::UnsupportedBlockSize(_) => libc::EOPNOTSUPP,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// Byte index of the failing block, when the error is tied to one.
    #[must_use]
    pub fn block_index(&self) -> Option<u64> {
        match self {
            Self::CorruptLength { index, .. } | Self::Decompression { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Result alias using `BsqError`.
pub type Result<T> = std::result::Result<T, BsqError>;
