//! Windowed reads of regular file contents.
//!
//! An open file keeps one window of `WINDOW_PAGES` decoded pages. A read
//! whose position falls in the resident window is served from memory; any
//! other position first refills the window from the data blocks covering it.
//! The window is only marked resident once every block in it decoded
//! successfully.

use crate::SquashFs;
use asupersync::Cx;
use bsq_decompress::{Page, PageActor, alloc_page};
use bsq_error::{BsqError, Result};
use bsq_ondisk::FragmentEntry;
use bsq_types::{
    DataLength, NO_FRAGMENT, PAGE_CACHE_SIZE, WINDOW_PAGES, WINDOW_SIZE, page_in_window, window_of,
};
use std::io::SeekFrom;
use tracing::{debug, trace};

/// Where one data block of a file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    /// A stored block at byte `index` with its length word.
    Block { index: u64, length: DataLength },
    /// A hole; reads as zeros.
    Sparse,
    /// The file's tail, `size` bytes at `offset` in a shared fragment block.
    Fragment {
        entry: FragmentEntry,
        offset: u32,
        size: u32,
    },
}

/// Maps a file's data blocks to their on-disk locations.
///
/// Inode parsing lives outside this crate; anything that can answer these
/// three questions can be read through a [`FileHandle`].
pub trait FileLayout {
    fn file_size(&self) -> u64;

    /// Data block size in bytes.
    fn block_size(&self) -> u32;

    /// Locate data block `block` (0-based) of the file.
    fn locate(&self, cx: &Cx, fs: &SquashFs, block: u64) -> Result<BlockLocation>;
}

/// Fragment holding a file's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
}

impl FragmentRef {
    /// Fragment fields as an inode stores them; `NO_FRAGMENT` means the
    /// file has none.
    #[must_use]
    pub fn from_inode(index: u32, offset: u32) -> Option<Self> {
        (index != NO_FRAGMENT).then_some(Self { index, offset })
    }
}

/// Layout of a regular file as recorded in its inode: the byte index of the
/// first data block, one length word per full block and an optional tail
/// fragment.
#[derive(Debug, Clone)]
pub struct RegularFileLayout {
    file_size: u64,
    block_size: u32,
    lengths: Vec<DataLength>,
    /// Byte index of each entry in `lengths`.
    starts: Vec<u64>,
    fragment: Option<FragmentRef>,
}

impl RegularFileLayout {
    pub fn new(
        start_block: u64,
        file_size: u64,
        block_size: u32,
        lengths: Vec<DataLength>,
        fragment: Option<FragmentRef>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(BsqError::InvalidArgument("block size must be non-zero".into()));
        }
        let bs = u64::from(block_size);
        let expected = if fragment.is_some() {
            file_size / bs
        } else {
            file_size.div_ceil(bs)
        };
        if lengths.len() as u64 != expected {
            return Err(BsqError::Format(format!(
                "file of {file_size} bytes needs {expected} block lengths, inode lists {}",
                lengths.len()
            )));
        }
        if let Some(frag) = fragment {
            let tail = file_size % bs;
            if tail == 0 {
                return Err(BsqError::Format(
                    "fragment given for a file without a partial tail".into(),
                ));
            }
            if u64::from(frag.offset) + tail > bs {
                return Err(BsqError::Format(format!(
                    "tail of {tail} bytes at fragment offset {} overruns the block",
                    frag.offset
                )));
            }
        }

        let mut starts = Vec::new();
        starts
            .try_reserve_exact(lengths.len())
            .map_err(|_| BsqError::OutOfMemory)?;
        let mut next = start_block;
        for length in &lengths {
            starts.push(next);
            next = next
                .checked_add(u64::from(length.size()))
                .ok_or_else(|| BsqError::Format("block list overflows the image".into()))?;
        }

        Ok(Self {
            file_size,
            block_size,
            lengths,
            starts,
            fragment,
        })
    }
}

impl FileLayout for RegularFileLayout {
    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn locate(&self, cx: &Cx, fs: &SquashFs, block: u64) -> Result<BlockLocation> {
        let bs = u64::from(self.block_size);
        if block.saturating_mul(bs) >= self.file_size {
            return Err(BsqError::InvalidArgument(format!(
                "block {block} lies past end of file ({} bytes)",
                self.file_size
            )));
        }
        if let Ok(slot) = usize::try_from(block) {
            if let Some(&length) = self.lengths.get(slot) {
                if length.is_sparse() {
                    return Ok(BlockLocation::Sparse);
                }
                return Ok(BlockLocation::Block {
                    index: self.starts[slot],
                    length,
                });
            }
        }
        let Some(frag) = self.fragment else {
            return Err(BsqError::InvalidArgument(format!(
                "block {block} has no location"
            )));
        };
        Ok(BlockLocation::Fragment {
            entry: fs.fragment_entry(cx, frag.index)?,
            offset: frag.offset,
            // Bounded by the block size, checked in `new`.
            size: (self.file_size - block * bs) as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    /// Decoded contents of window `n` (file bytes `n * WINDOW_SIZE..`).
    Resident(u64),
}

/// The decoded window of one open file.
pub struct FileReadWindow {
    state: WindowState,
    pages: Vec<Page>,
    refills: u64,
}

impl std::fmt::Debug for FileReadWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReadWindow")
            .field("state", &self.state)
            .field("pages", &self.pages.len())
            .field("refills", &self.refills)
            .finish()
    }
}

/// Reject data block sizes the window cannot be tiled with.
fn check_block_size(block_size: u32) -> Result<()> {
    if block_size as usize > WINDOW_SIZE {
        return Err(BsqError::UnsupportedBlockSize(format!(
            "data block size {block_size} exceeds the {WINDOW_SIZE}-byte read window"
        )));
    }
    if !block_size.is_power_of_two() || (block_size as usize) < PAGE_CACHE_SIZE {
        return Err(BsqError::UnsupportedBlockSize(format!(
            "data block size {block_size} is not a power of two of at least one page"
        )));
    }
    Ok(())
}

impl FileReadWindow {
    /// Allocate the window pages up front, so reads never allocate them.
    pub fn new() -> Result<Self> {
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(WINDOW_PAGES)
            .map_err(|_| BsqError::OutOfMemory)?;
        for _ in 0..WINDOW_PAGES {
            pages.push(alloc_page()?);
        }
        Ok(Self {
            state: WindowState::Empty,
            pages,
            refills: 0,
        })
    }

    #[must_use]
    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Number of successful refills since open.
    #[must_use]
    pub fn refills(&self) -> u64 {
        self.refills
    }

    /// Copy file bytes starting at `pos` into `dest`, refilling the window
    /// whenever `pos` leaves it. Reads stop at end of file.
    pub fn read<L: FileLayout + ?Sized>(
        &mut self,
        cx: &Cx,
        fs: &SquashFs,
        layout: &L,
        pos: u64,
        dest: &mut [u8],
    ) -> Result<usize> {
        let file_size = layout.file_size();
        if pos >= file_size {
            return Ok(0);
        }
        let len = usize::try_from(file_size - pos)
            .unwrap_or(usize::MAX)
            .min(dest.len());

        let mut done = 0;
        while done < len {
            let at = pos + done as u64;
            let window = window_of(at);
            if self.state != WindowState::Resident(window) {
                self.refill(cx, fs, layout, window)?;
            }
            let page = &self.pages[page_in_window(at)];
            // Remainder is below PAGE_CACHE_SIZE.
            let offset = (at % PAGE_CACHE_SIZE as u64) as usize;
            let n = (PAGE_CACHE_SIZE - offset).min(len - done);
            dest[done..done + n].copy_from_slice(&page[offset..offset + n]);
            done += n;
        }
        Ok(done)
    }

    fn refill<L: FileLayout + ?Sized>(
        &mut self,
        cx: &Cx,
        fs: &SquashFs,
        layout: &L,
        window: u64,
    ) -> Result<()> {
        self.state = WindowState::Empty;
        check_block_size(layout.block_size())?;
        for page in &mut self.pages {
            page.fill(0);
        }

        let block_size = layout.block_size() as usize;
        let per_window = WINDOW_SIZE / block_size;
        let pages_per_block = block_size / PAGE_CACHE_SIZE;
        let first = window * per_window as u64;
        let blocks = layout.file_size().div_ceil(block_size as u64);
        debug!(window, first_block = first, per_window, "refilling read window");

        for k in 0..per_window {
            let block = first + k as u64;
            if block >= blocks {
                break;
            }
            let slots = k * pages_per_block..(k + 1) * pages_per_block;
            let pages: Vec<Page> = self.pages[slots.clone()]
                .iter_mut()
                .map(std::mem::take)
                .collect();
            let mut actor = PageActor::with_pages(pages, block_size);
            let filled = fill_block(cx, fs, layout, block, &mut actor);
            for (slot, page) in self.pages[slots].iter_mut().zip(actor.into_pages()) {
                *slot = page;
            }
            filled?;
        }

        self.state = WindowState::Resident(window);
        self.refills += 1;
        Ok(())
    }
}

/// Decode data block `block` of the file into `actor` (capacity: one block).
fn fill_block<L: FileLayout + ?Sized>(
    cx: &Cx,
    fs: &SquashFs,
    layout: &L,
    block: u64,
    actor: &mut PageActor,
) -> Result<()> {
    let block_size = u64::from(layout.block_size());
    let expected = (layout.file_size() - block * block_size).min(block_size) as usize;

    match layout.locate(cx, fs, block)? {
        BlockLocation::Sparse => {
            trace!(block, "sparse block");
            actor.fill(0, expected)?;
        }
        BlockLocation::Block { index, length } => {
            let got = fs.read_data(cx, index, length, actor)?;
            if got != expected {
                return Err(BsqError::Decompression {
                    index,
                    detail: format!("block {block} decoded to {got} bytes, expected {expected}"),
                });
            }
        }
        BlockLocation::Fragment {
            entry,
            offset,
            size,
        } => {
            let mut scratch = PageActor::new(block_size as usize);
            fs.read_data(cx, entry.start_block, entry.size, &mut scratch)?;
            let decoded = scratch.to_vec()?;
            let start = offset as usize;
            let end = start + size as usize;
            if end > decoded.len() || size as usize != expected {
                return Err(BsqError::Decompression {
                    index: entry.start_block,
                    detail: format!(
                        "fragment of {} bytes cannot hold tail {start}..{end}",
                        decoded.len()
                    ),
                });
            }
            actor.write(&decoded[start..end])?;
        }
    }
    Ok(())
}

/// An open regular file with its own read window and position.
#[derive(Debug)]
pub struct FileHandle<'fs, L: FileLayout> {
    fs: &'fs SquashFs,
    layout: L,
    window: FileReadWindow,
    pos: u64,
}

impl SquashFs {
    /// Open a file for reading.
    ///
    /// The data block size must be a power of two between one page and the
    /// window size.
    pub fn open<L: FileLayout>(&self, layout: L) -> Result<FileHandle<'_, L>> {
        let block_size = layout.block_size();
        if block_size != self.params.block_size {
            return Err(BsqError::InvalidArgument(format!(
                "layout block size {block_size} differs from image block size {}",
                self.params.block_size
            )));
        }
        check_block_size(block_size)?;

        debug!(file_size = layout.file_size(), block_size, "opened file");
        Ok(FileHandle {
            fs: self,
            layout,
            window: FileReadWindow::new()?,
            pos: 0,
        })
    }
}

impl<L: FileLayout> FileHandle<'_, L> {
    /// Read at the current position and advance it.
    pub fn read(&mut self, cx: &Cx, dest: &mut [u8]) -> Result<usize> {
        let n = self.read_at(cx, self.pos, dest)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read at `pos` without moving the position.
    pub fn read_at(&mut self, cx: &Cx, pos: u64, dest: &mut [u8]) -> Result<usize> {
        self.window.read(cx, self.fs, &self.layout, pos, dest)
    }

    /// Read from the current position to end of file.
    pub fn read_to_end(&mut self, cx: &Cx) -> Result<Vec<u8>> {
        let left = self.layout.file_size().saturating_sub(self.pos);
        let mut out = Vec::new();
        out.try_reserve_exact(usize::try_from(left).map_err(|_| BsqError::OutOfMemory)?)
            .map_err(|_| BsqError::OutOfMemory)?;
        let mut buf = vec![0_u8; WINDOW_SIZE];
        loop {
            let n = self.read(cx, &mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    pub fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        let target = match to {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.layout.file_size().checked_add_signed(delta),
        };
        let pos = target.ok_or_else(|| {
            BsqError::InvalidArgument(format!("seek {to:?} from {} is out of range", self.pos))
        })?;
        self.pos = pos;
        Ok(pos)
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.layout.file_size()
    }

    #[must_use]
    pub fn layout(&self) -> &L {
        &self.layout
    }

    #[must_use]
    pub fn window(&self) -> &FileReadWindow {
        &self.window
    }

    /// Release the window pages.
    pub fn close(self) {
        debug!(refills = self.window.refills(), "closed file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MountOptions;
    use bsq_block::MemoryByteDevice;
    use bsq_ondisk::{INVALID_TABLE, Superblock, SuperblockFlags};
    use bsq_types::{CompressionId, SUPERBLOCK_SIZE};
    use std::sync::Arc;

    /// Image with a superblock and nothing else.
    fn empty_image() -> SquashFs {
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
            bytes_used: SUPERBLOCK_SIZE as u64,
            id_table_start: INVALID_TABLE,
            xattr_table_start: INVALID_TABLE,
            inode_table_start: 96,
            directory_table_start: 96,
            fragment_table_start: INVALID_TABLE,
            lookup_table_start: INVALID_TABLE,
        };
        let mut image = sb.to_bytes().to_vec();
        image.resize(4096, 0);
        SquashFs::mount(
            &Cx::for_testing(),
            Arc::new(MemoryByteDevice::new(image)),
            &MountOptions::default(),
        )
        .expect("mount")
    }

    /// A file made only of holes.
    struct Holes {
        file_size: u64,
    }

    impl FileLayout for Holes {
        fn file_size(&self) -> u64 {
            self.file_size
        }

        fn block_size(&self) -> u32 {
            4096
        }

        fn locate(&self, _cx: &Cx, _fs: &SquashFs, _block: u64) -> Result<BlockLocation> {
            Ok(BlockLocation::Sparse)
        }
    }

    #[test]
    fn refill_clears_pages_past_end_of_file() {
        let cx = Cx::for_testing();
        let fs = empty_image();
        let mut window = FileReadWindow::new().expect("window");
        for page in &mut window.pages {
            page.fill(0xAA);
        }

        let layout = Holes { file_size: 5000 };
        window.refill(&cx, &fs, &layout, 0).expect("refill");
        assert_eq!(window.state(), WindowState::Resident(0));
        assert!(window.pages.iter().all(|page| page.iter().all(|&b| b == 0)));
    }

    #[test]
    fn reads_land_on_the_right_page() {
        let cx = Cx::for_testing();
        let fs = empty_image();
        let mut window = FileReadWindow::new().expect("window");
        let layout = Holes {
            file_size: 3 * WINDOW_SIZE as u64,
        };

        let mut buf = [0xFF_u8; 10];
        let pos = WINDOW_SIZE as u64 + 5 * PAGE_CACHE_SIZE as u64 - 4;
        assert_eq!(window.read(&cx, &fs, &layout, pos, &mut buf).expect("read"), 10);
        assert_eq!(buf, [0; 10]);
        assert_eq!(window.state(), WindowState::Resident(1));
    }
}
