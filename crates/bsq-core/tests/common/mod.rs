#![allow(dead_code)]

//! In-memory image builder for integration tests and benches.

use bsq_core::{
    CompressionId, DataLength, FragmentEntry, FragmentRef, RegularFileLayout, Superblock,
    SuperblockFlags,
};
use bsq_ondisk::INVALID_TABLE;
use std::io::Write;

pub fn compress(id: CompressionId, data: &[u8]) -> Vec<u8> {
    match id {
        CompressionId::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data).expect("zlib compress");
            enc.finish().expect("zlib finish")
        }
        CompressionId::Lz4 => lz4_flex::block::compress(data),
        CompressionId::Zstd => zstd::bulk::compress(data, 3).expect("zstd compress"),
        other => panic!("no test encoder for {other}"),
    }
}

/// Text-like bytes that compress well but never repeat within a window.
pub fn file_bytes(len: usize, seed: u32) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let word = (i / 16) as u32;
            (word.wrapping_mul(2_654_435_761).wrapping_add(seed) >> 24) as u8 & 0x3F | 0x40
        })
        .collect()
}

/// Bytes that do not compress.
pub fn noise(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// What the inode of a built file would record.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub start_block: u64,
    pub file_size: u64,
    pub lengths: Vec<DataLength>,
    pub fragment: Option<FragmentRef>,
}

impl FileSpec {
    pub fn layout(&self, block_size: u32) -> RegularFileLayout {
        RegularFileLayout::new(
            self.start_block,
            self.file_size,
            block_size,
            self.lengths.clone(),
            self.fragment,
        )
        .expect("layout")
    }
}

pub struct ImageBuilder {
    compression: CompressionId,
    block_log: u16,
    image: Vec<u8>,
    fragments: Vec<FragmentEntry>,
    pending_fragment: Vec<u8>,
    /// Store all-zero blocks as holes.
    pub sparse_zeros: bool,
    /// Pad the finished image to this multiple, past `bytes_used`.
    pub pad_to: usize,
}

impl ImageBuilder {
    pub fn new(compression: CompressionId, block_log: u16) -> Self {
        Self {
            compression,
            block_log,
            image: vec![0_u8; 96],
            fragments: Vec::new(),
            pending_fragment: Vec::new(),
            sparse_zeros: true,
            pad_to: 4096,
        }
    }

    pub fn block_size(&self) -> u32 {
        1 << self.block_log
    }

    pub fn position(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn pad(&mut self, len: usize) {
        self.image.resize(self.image.len() + len, 0);
    }

    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.image.extend_from_slice(bytes);
    }

    /// Store one data block, raw when compression does not help.
    pub fn push_data_block(&mut self, data: &[u8]) -> (u64, DataLength) {
        let index = self.position();
        let packed = compress(self.compression, data);
        let length = if packed.len() < data.len() {
            self.image.extend_from_slice(&packed);
            DataLength::new(packed.len() as u32)
        } else {
            self.image.extend_from_slice(data);
            DataLength::uncompressed(data.len() as u32)
        };
        (index, length)
    }

    /// Store a metadata block with its length header; returns its index.
    pub fn push_metadata_block(&mut self, data: &[u8]) -> u64 {
        assert!(data.len() <= 8192);
        let index = self.position();
        let packed = compress(self.compression, data);
        if packed.len() < data.len() {
            self.image
                .extend_from_slice(&(packed.len() as u16).to_le_bytes());
            self.image.extend_from_slice(&packed);
        } else {
            self.image
                .extend_from_slice(&(data.len() as u16 | 0x8000).to_le_bytes());
            self.image.extend_from_slice(data);
        }
        index
    }

    /// Store a regular file. With `tail_fragment` the partial last block
    /// goes into a shared fragment block.
    pub fn add_file(&mut self, data: &[u8], tail_fragment: bool) -> FileSpec {
        let bs = self.block_size() as usize;
        let start_block = self.position();
        let full = if tail_fragment { data.len() / bs } else { data.len().div_ceil(bs) };
        let mut lengths = Vec::new();
        for chunk in data.chunks(bs).take(full) {
            if self.sparse_zeros && chunk.len() == bs && chunk.iter().all(|&b| b == 0) {
                lengths.push(DataLength::new(0));
            } else {
                lengths.push(self.push_data_block(chunk).1);
            }
        }

        let tail = &data[full * bs..];
        let fragment = if tail_fragment && !tail.is_empty() {
            if self.pending_fragment.len() + tail.len() > bs {
                self.flush_fragment();
            }
            let frag = FragmentRef {
                index: self.fragments.len() as u32,
                offset: self.pending_fragment.len() as u32,
            };
            self.pending_fragment.extend_from_slice(tail);
            Some(frag)
        } else {
            None
        };

        FileSpec {
            start_block,
            file_size: data.len() as u64,
            lengths,
            fragment,
        }
    }

    fn flush_fragment(&mut self) {
        if self.pending_fragment.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.pending_fragment);
        let (start_block, size) = self.push_data_block(&data);
        self.fragments.push(FragmentEntry { start_block, size });
    }

    /// Write fragment tables and the superblock. Returns the image.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush_fragment();

        let mut pointers = Vec::new();
        let entries: Vec<u8> = self
            .fragments
            .iter()
            .flat_map(FragmentEntry::to_bytes)
            .collect();
        for chunk in entries.chunks(8192) {
            pointers.push(self.push_metadata_block(chunk));
        }
        let fragment_table_start = if pointers.is_empty() {
            INVALID_TABLE
        } else {
            let start = self.position();
            for ptr in &pointers {
                self.image.extend_from_slice(&ptr.to_le_bytes());
            }
            start
        };

        let bytes_used = self.position();
        let sb = Superblock {
            inodes: 1,
            mkfs_time: 0,
            block_size: self.block_size(),
            fragments: self.fragments.len() as u32,
            compression: self.compression,
            block_log: self.block_log,
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
            fragment_table_start,
            lookup_table_start: INVALID_TABLE,
        };
        self.image[..96].copy_from_slice(&sb.to_bytes());
        if self.pad_to > 0 {
            let padded = self.image.len().div_ceil(self.pad_to) * self.pad_to;
            self.image.resize(padded, 0);
        }
        self.image
    }
}
