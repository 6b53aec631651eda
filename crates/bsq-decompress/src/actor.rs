//! Page-granular output sink shared by the decompressors and the raw copy
//! path.
//!
//! A [`PageActor`] hands out fixed-size pages one at a time, so neither the
//! caller nor the codec needs to know up front how many pages a block will
//! fill. Pages are allocated lazily, up to the byte capacity the actor was
//! created with.

use bsq_block::try_alloc_zeroed;
use bsq_error::{BsqError, Result};
use bsq_types::PAGE_CACHE_SIZE;

/// One output page of `PAGE_CACHE_SIZE` bytes.
pub type Page = Box<[u8]>;

/// Allocate a zeroed page, reporting allocation failure.
pub fn alloc_page() -> Result<Page> {
    Ok(try_alloc_zeroed(PAGE_CACHE_SIZE)?.into_boxed_slice())
}

#[derive(Debug)]
pub struct PageActor {
    pages: Vec<Page>,
    capacity: usize,
    page_limit: usize,
    /// Page the cursor is in; `None` until the first page is selected.
    current: Option<usize>,
    /// Bytes used in the current page. Never exceeds the page size.
    offset: usize,
    last_page_len: usize,
}

impl PageActor {
    /// Actor that may produce up to `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_pages(Vec::new(), capacity)
    }

    /// Actor reusing previously allocated pages. Missing pages are allocated
    /// on demand; pages of the wrong size are replaced when selected.
    #[must_use]
    pub fn with_pages(pages: Vec<Page>, capacity: usize) -> Self {
        Self {
            pages,
            capacity,
            page_limit: capacity.div_ceil(PAGE_CACHE_SIZE),
            current: None,
            offset: 0,
            last_page_len: 0,
        }
    }

    /// Declared output capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes produced so far.
    #[must_use]
    pub fn written(&self) -> usize {
        self.current
            .map_or(0, |idx| idx * PAGE_CACHE_SIZE + self.offset)
    }

    /// Bytes that may still be produced.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.written()
    }

    fn page_capacity(&self, idx: usize) -> usize {
        PAGE_CACHE_SIZE.min(self.capacity - idx * PAGE_CACHE_SIZE)
    }

    fn select_page(&mut self, idx: usize) -> Result<bool> {
        if idx >= self.page_limit {
            return Ok(false);
        }
        while self.pages.len() <= idx {
            self.pages
                .try_reserve(1)
                .map_err(|_| BsqError::OutOfMemory)?;
            self.pages.push(alloc_page()?);
        }
        if self.pages[idx].len() != PAGE_CACHE_SIZE {
            self.pages[idx] = alloc_page()?;
        }
        self.current = Some(idx);
        self.offset = 0;
        Ok(true)
    }

    /// Writable remainder of the cursor page.
    ///
    /// When the cursor page is full the next page is selected first.
    /// Returns `None` once the capacity is exhausted.
    pub fn current_page(&mut self) -> Result<Option<&mut [u8]>> {
        let idx = match self.current {
            Some(idx) if self.offset < self.page_capacity(idx) => idx,
            _ => return self.advance_page(),
        };
        let end = self.page_capacity(idx);
        Ok(Some(&mut self.pages[idx][self.offset..end]))
    }

    /// Move the cursor to the start of the next page.
    ///
    /// Only valid when the current page is full (or none is selected yet).
    pub fn advance_page(&mut self) -> Result<Option<&mut [u8]>> {
        debug_assert!(
            self.current
                .is_none_or(|idx| self.offset == self.page_capacity(idx)),
            "advance_page on a partially filled page"
        );
        let next = self.current.map_or(0, |idx| idx + 1);
        if !self.select_page(next)? {
            return Ok(None);
        }
        let end = self.page_capacity(next);
        Ok(Some(&mut self.pages[next][..end]))
    }

    /// Record that `n` bytes of the slice last returned were filled.
    pub fn advance(&mut self, n: usize) {
        let Some(idx) = self.current else {
            debug_assert_eq!(n, 0, "advance without a selected page");
            return;
        };
        debug_assert!(self.offset + n <= self.page_capacity(idx));
        self.offset += n;
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken.
    pub fn write(&mut self, mut data: &[u8]) -> Result<usize> {
        let mut taken = 0;
        while !data.is_empty() {
            let Some(page) = self.current_page()? else {
                break;
            };
            let n = page.len().min(data.len());
            page[..n].copy_from_slice(&data[..n]);
            self.advance(n);
            data = &data[n..];
            taken += n;
        }
        Ok(taken)
    }

    /// Append `n` copies of `byte`; returns the number of bytes written.
    pub fn fill(&mut self, byte: u8, mut n: usize) -> Result<usize> {
        let mut done = 0;
        while n > 0 {
            let Some(page) = self.current_page()? else {
                break;
            };
            let len = page.len().min(n);
            page[..len].fill(byte);
            self.advance(len);
            n -= len;
            done += len;
        }
        Ok(done)
    }

    /// Close the output: records how much of the last page is in use and
    /// returns the total number of bytes produced.
    pub fn finish(&mut self) -> usize {
        self.last_page_len = self.offset;
        self.written()
    }

    /// Used length of the last page, as recorded by [`PageActor::finish`].
    #[must_use]
    pub fn last_page_len(&self) -> usize {
        self.last_page_len
    }

    #[must_use]
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    #[must_use]
    pub fn into_pages(self) -> Vec<Page> {
        self.pages
    }

    /// Copy of the bytes produced so far, in order.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let written = self.written();
        let mut out = Vec::new();
        out.try_reserve_exact(written)
            .map_err(|_| BsqError::OutOfMemory)?;
        let mut left = written;
        for page in &self.pages {
            if left == 0 {
                break;
            }
            let n = left.min(page.len());
            out.extend_from_slice(&page[..n]);
            left -= n;
        }
        Ok(out)
    }
}
