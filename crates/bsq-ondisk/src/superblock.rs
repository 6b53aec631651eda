//! Version 4.0 superblock.

use bsq_types::{
    CompressionId, MAX_DATA_BLOCK_LOG, MAX_DATA_BLOCK_SIZE, MIN_DATA_BLOCK_LOG, ParseError,
    SQUASHFS_MAGIC, SQUASHFS_MAJOR, SQUASHFS_MINOR, SUPERBLOCK_SIZE, read_le_u16, read_le_u32,
    read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Table start value meaning "table not present".
pub const INVALID_TABLE: u64 = u64::MAX;

/// Superblock flags (`flags` at offset 24).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockFlags(pub u16);

impl SuperblockFlags {
    pub const UNCOMPRESSED_INODES: Self = Self(0x0001);
    pub const UNCOMPRESSED_DATA: Self = Self(0x0002);
    pub const CHECK: Self = Self(0x0004);
    pub const UNCOMPRESSED_FRAGMENTS: Self = Self(0x0008);
    pub const NO_FRAGMENTS: Self = Self(0x0010);
    pub const ALWAYS_FRAGMENTS: Self = Self(0x0020);
    pub const DUPLICATES: Self = Self(0x0040);
    pub const EXPORTABLE: Self = Self(0x0080);
    pub const UNCOMPRESSED_XATTRS: Self = Self(0x0100);
    pub const NO_XATTRS: Self = Self(0x0200);
    pub const COMPRESSOR_OPTIONS: Self = Self(0x0400);
    pub const UNCOMPRESSED_IDS: Self = Self(0x0800);

    const KNOWN: &[(u16, &'static str)] = &[
        (0x0001, "UNCOMPRESSED_INODES"),
        (0x0002, "UNCOMPRESSED_DATA"),
        (0x0004, "CHECK"),
        (0x0008, "UNCOMPRESSED_FRAGMENTS"),
        (0x0010, "NO_FRAGMENTS"),
        (0x0020, "ALWAYS_FRAGMENTS"),
        (0x0040, "DUPLICATES"),
        (0x0080, "EXPORTABLE"),
        (0x0100, "UNCOMPRESSED_XATTRS"),
        (0x0200, "NO_XATTRS"),
        (0x0400, "COMPRESSOR_OPTIONS"),
        (0x0800, "UNCOMPRESSED_IDS"),
    ];

    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Names of all set flags.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        Self::KNOWN
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::fmt::Display for SuperblockFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return f.write_str("(none)");
        }
        let mut first = true;
        let mut remaining = self.0;
        for &(bit, name) in Self::KNOWN {
            if remaining & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                remaining &= !bit;
                first = false;
            }
        }
        if remaining != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "0x{remaining:X}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub inodes: u32,
    pub mkfs_time: u32,
    /// Data block size in bytes; always `1 << block_log`.
    pub block_size: u32,
    pub fragments: u32,
    pub compression: CompressionId,
    pub block_log: u16,
    pub flags: SuperblockFlags,
    pub no_ids: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: u64,
    /// Bytes of the image in use; no block may reach past this.
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub lookup_table_start: u64,
}

impl Superblock {
    /// Parse and validate the superblock at the start of `region`.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u32(region, 0)?;
        if magic != SQUASHFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SQUASHFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let version_major = read_le_u16(region, 28)?;
        let version_minor = read_le_u16(region, 30)?;
        if version_major != SQUASHFS_MAJOR || version_minor != SQUASHFS_MINOR {
            return Err(ParseError::InvalidField {
                field: "s_major",
                reason: "unsupported version",
            });
        }

        let block_size = read_le_u32(region, 12)?;
        let block_log = read_le_u16(region, 22)?;
        if !(MIN_DATA_BLOCK_LOG..=MAX_DATA_BLOCK_LOG).contains(&block_log) {
            return Err(ParseError::InvalidField {
                field: "block_log",
                reason: "out of range",
            });
        }
        if block_size > MAX_DATA_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "larger than 1 MiB",
            });
        }
        if block_size != 1_u32 << block_log {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "does not match block_log",
            });
        }

        let compression = CompressionId::from_raw(read_le_u16(region, 20)?)?;

        let bytes_used = read_le_u64(region, 40)?;
        if bytes_used < SUPERBLOCK_SIZE as u64 {
            return Err(ParseError::InvalidField {
                field: "bytes_used",
                reason: "smaller than the superblock",
            });
        }

        Ok(Self {
            inodes: read_le_u32(region, 4)?,
            mkfs_time: read_le_u32(region, 8)?,
            block_size,
            fragments: read_le_u32(region, 16)?,
            compression,
            block_log,
            flags: SuperblockFlags(read_le_u16(region, 24)?),
            no_ids: read_le_u16(region, 26)?,
            version_major,
            version_minor,
            root_inode: read_le_u64(region, 32)?,
            bytes_used,
            id_table_start: read_le_u64(region, 48)?,
            xattr_table_start: read_le_u64(region, 56)?,
            inode_table_start: read_le_u64(region, 64)?,
            directory_table_start: read_le_u64(region, 72)?,
            fragment_table_start: read_le_u64(region, 80)?,
            lookup_table_start: read_le_u64(region, 88)?,
        })
    }

    /// Serialize back to the 96-byte on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut out = [0_u8; SUPERBLOCK_SIZE];
        out[0..4].copy_from_slice(&SQUASHFS_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.inodes.to_le_bytes());
        out[8..12].copy_from_slice(&self.mkfs_time.to_le_bytes());
        out[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.fragments.to_le_bytes());
        out[20..22].copy_from_slice(&self.compression.raw().to_le_bytes());
        out[22..24].copy_from_slice(&self.block_log.to_le_bytes());
        out[24..26].copy_from_slice(&self.flags.0.to_le_bytes());
        out[26..28].copy_from_slice(&self.no_ids.to_le_bytes());
        out[28..30].copy_from_slice(&self.version_major.to_le_bytes());
        out[30..32].copy_from_slice(&self.version_minor.to_le_bytes());
        out[32..40].copy_from_slice(&self.root_inode.to_le_bytes());
        out[40..48].copy_from_slice(&self.bytes_used.to_le_bytes());
        out[48..56].copy_from_slice(&self.id_table_start.to_le_bytes());
        out[56..64].copy_from_slice(&self.xattr_table_start.to_le_bytes());
        out[64..72].copy_from_slice(&self.inode_table_start.to_le_bytes());
        out[72..80].copy_from_slice(&self.directory_table_start.to_le_bytes());
        out[80..88].copy_from_slice(&self.fragment_table_start.to_le_bytes());
        out[88..96].copy_from_slice(&self.lookup_table_start.to_le_bytes());
        out
    }

    /// Whether the image carries a fragment table.
    #[must_use]
    pub fn has_fragments(&self) -> bool {
        self.fragments > 0 && self.fragment_table_start != INVALID_TABLE
    }
}
