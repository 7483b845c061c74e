//! Demand Paging Engine
//!
//! Resolves a faulting address to a segment and page of the active
//! [`ExecutableImage`] and materializes exactly that page.
//!
//! ## Servicing a page
//! 1. Find the first segment with a page holding the address.
//! 2. Compute the page index and allocate the segment's [`ResidencyMap`] on
//!    first use.
//! 3. Refuse pages that are already resident; such a fault is a real access
//!    violation.
//! 4. Map the page writable, read its file-backed window with an explicit
//!    seek, zero the rest, then apply the segment permissions.
//!
//! Read errors are not fatal: whatever could not be read stays zero.

use core::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use log::{trace, warn};

use super::PageMapper;
use crate::{
    error::LoaderResult,
    image::{ExecutableImage, FileWindow},
};

/// Outcome of a fault handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceResult {
    /// The page was mapped and populated; the faulting access can resume.
    Serviced,
    /// The address is outside every known segment.
    NotOurs,
    /// The page is already resident, so the fault is a genuine violation.
    AlreadyResident,
}

// ===========================================================================
// Residency tracking
// ===========================================================================

/// Per-page "has been faulted in" flags for one segment.
///
/// Unallocated until the first fault into the segment.
#[derive(Debug, Clone, Default)]
pub struct ResidencyMap {
    pages: Option<Vec<bool>>,
}

impl ResidencyMap {
    pub const fn new() -> Self {
        Self { pages: None }
    }

    pub fn is_allocated(&self) -> bool {
        self.pages.is_some()
    }

    /// Number of tracked pages (0 while unallocated).
    pub fn len(&self) -> usize {
        self.pages.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate `page_count` entries, all not resident. No-op once
    /// allocated.
    pub fn ensure_allocated(&mut self, page_count: usize) {
        if self.pages.is_none() {
            self.pages = Some(vec![false; page_count]);
        }
    }

    /// Out-of-range and unallocated indices report not resident.
    pub fn is_resident(&self, index: usize) -> bool {
        self.pages
            .as_ref()
            .and_then(|p| p.get(index).copied())
            .unwrap_or(false)
    }

    /// Returns false if `index` is not tracked.
    pub fn mark_resident(&mut self, index: usize) -> bool {
        match self.pages.as_mut().and_then(|p| p.get_mut(index)) {
            Some(entry) => {
                *entry = true;
                true
            }
            None => false,
        }
    }

    pub fn resident_count(&self) -> usize {
        self.pages
            .as_ref()
            .map_or(0, |p| p.iter().filter(|&&r| r).count())
    }
}

// ===========================================================================
// Backing file access
// ===========================================================================

/// Source of segment content.
pub trait PageSource {
    /// Fill `buf` with bytes starting at `offset`.
    ///
    /// Returns how many bytes were read. Short reads are accumulated; EOF or
    /// an error ends the read early and the remainder of `buf` is left
    /// untouched.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> usize;
}

/// Allocation-free rendering of an I/O error for the fault path.
///
/// `io::Error`'s own `Display` calls `strerror` into a fresh `String` for
/// OS errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IoFailure {
    kind: io::ErrorKind,
    errno: Option<i32>,
}

impl From<&io::Error> for IoFailure {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            errno: err.raw_os_error(),
        }
    }
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(errno) = self.errno {
            write!(f, " (errno {})", errno)?;
        }
        Ok(())
    }
}

impl<T: Read + Seek> PageSource for T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        if let Err(err) = self.seek(SeekFrom::Start(offset)) {
            warn!("seek to {:#x} failed: {}", offset, IoFailure::from(&err));
            return 0;
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => {
                    warn!(
                        "read at {:#x} failed after {} bytes: {}",
                        offset,
                        filled,
                        IoFailure::from(&err)
                    );
                    break;
                }
            }
        }
        filled
    }
}

/// Populate a freshly mapped page: file bytes in `window`, zero elsewhere.
fn fill_page<S: PageSource>(source: &mut S, page: &mut [u8], window: Option<FileWindow>) -> usize {
    let Some(window) = window else {
        page.fill(0);
        return 0;
    };

    let end = window.page_offset + window.len;
    page[..window.page_offset].fill(0);
    let read = source.read_at(window.file_offset, &mut page[window.page_offset..end]);
    page[window.page_offset + read..].fill(0);
    read
}

// ===========================================================================
// Engine
// ===========================================================================

/// Fault outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingStats {
    pub serviced: u64,
    pub not_ours: u64,
    pub already_resident: u64,
    /// File bytes copied into serviced pages.
    pub bytes_read: u64,
}

/// Services faults against one executable image.
///
/// Generic over where content comes from ([`PageSource`]) and how pages are
/// installed ([`PageMapper`]).
pub struct DemandPager<S, M> {
    image: ExecutableImage,
    source: S,
    mapper: M,
    page_size: usize,
    stats: PagingStats,
}

impl<S: PageSource, M: PageMapper> DemandPager<S, M> {
    pub fn new(image: ExecutableImage, source: S, mapper: M, page_size: usize) -> Self {
        Self {
            image,
            source,
            mapper,
            page_size,
            stats: PagingStats::default(),
        }
    }

    pub fn image(&self) -> &ExecutableImage {
        &self.image
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> PagingStats {
        self.stats
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Segment and page index for `addr`, if it belongs to the image.
    pub fn resolve(&self, addr: usize) -> Option<(usize, usize)> {
        self.image.find_segment(addr, self.page_size)
    }

    /// Residency of the page holding `addr`, or `None` outside the image.
    pub fn is_resident(&self, addr: usize) -> Option<bool> {
        let (seg_idx, page_index) = self.resolve(addr)?;
        Some(self.image.segments[seg_idx].residency().is_resident(page_index))
    }

    /// Handle a fault at `fault_address`.
    ///
    /// Errors come only from the mapper; the page is left non-resident in
    /// that case.
    pub fn service_fault(&mut self, fault_address: usize) -> LoaderResult<ServiceResult> {
        let page_size = self.page_size;

        let Some((seg_idx, page_index)) = self.resolve(fault_address) else {
            self.stats.not_ours += 1;
            return Ok(ServiceResult::NotOurs);
        };

        let segment = &mut self.image.segments[seg_idx];
        let page_count = segment.page_count(page_size);
        segment.residency_mut().ensure_allocated(page_count);

        if segment.residency().is_resident(page_index) {
            self.stats.already_resident += 1;
            return Ok(ServiceResult::AlreadyResident);
        }

        let page_start = segment.page_start(page_index, page_size);
        let window = segment.file_window(page_index, page_size);
        let permissions = segment.permissions;

        // SAFETY: `page_start` is the page-aligned start of a page inside a
        // segment of the active image. That range belongs to the loaded
        // program and is not yet resident, so nothing references it.
        let page = unsafe { self.mapper.map_writable(page_start, page_size)? };
        let read = fill_page(&mut self.source, page, window);

        // SAFETY: `page` is not used after this point.
        unsafe { self.mapper.protect(page_start, page_size, permissions)? };

        self.image.segments[seg_idx]
            .residency_mut()
            .mark_resident(page_index);
        self.stats.serviced += 1;
        self.stats.bytes_read += read as u64;

        trace!(
            "page {:#x} (segment {}, page {}): {} file bytes, {:?}",
            page_start,
            seg_idx,
            page_index,
            read,
            permissions
        );

        Ok(ServiceResult::Serviced)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
