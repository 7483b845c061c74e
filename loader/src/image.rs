//! Parsed executable image
//!
//! An [`ExecutableImage`] is built once per execution and never changes
//! shape afterwards; only the per-segment residency state is updated by the
//! fault path.

use crate::mm::{align_down, Permissions, ResidencyMap};

/// Location of the program header table once the image is in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeaders {
    /// Virtual address of the first program header (0 if not loaded).
    pub address: u64,
    /// Size of one program header entry.
    pub entry_size: u16,
    /// Number of program headers.
    pub count: u16,
}

/// One loadable region of the executable.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Base address of the segment in the process's address space.
    pub virtual_address: usize,
    /// Bytes the segment occupies in memory.
    pub memory_size: usize,
    /// Bytes backed by the executable file; never exceeds `memory_size`.
    pub file_size: usize,
    /// Offset of the segment's content in the executable file.
    pub file_offset: u64,
    /// Protection applied to each page once its content is in place.
    pub permissions: Permissions,
    residency: ResidencyMap,
}

/// The part of a page that is backed by file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWindow {
    /// Where to seek in the executable file.
    pub file_offset: u64,
    /// Where the bytes land relative to the start of the page.
    pub page_offset: usize,
    /// How many bytes to read.
    pub len: usize,
}

impl Segment {
    /// Create a segment with no resident pages.
    pub fn new(
        virtual_address: usize,
        memory_size: usize,
        file_size: usize,
        file_offset: u64,
        permissions: Permissions,
    ) -> Self {
        Self {
            virtual_address,
            memory_size,
            file_size: file_size.min(memory_size),
            file_offset,
            permissions,
            residency: ResidencyMap::new(),
        }
    }

    /// Check whether `addr` falls in `[virtual_address, virtual_address +
    /// memory_size]`. The upper bound is inclusive.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.virtual_address && addr - self.virtual_address <= self.memory_size
    }

    /// Start of the page holding the segment's first byte.
    pub fn page_base(&self, page_size: usize) -> usize {
        align_down(self.virtual_address, page_size)
    }

    /// Number of pages spanned by the segment.
    pub fn page_count(&self, page_size: usize) -> usize {
        let lead = self.virtual_address - self.page_base(page_size);
        (lead + self.memory_size).div_ceil(page_size)
    }

    /// Page index for an address inside this segment.
    pub fn page_index(&self, addr: usize, page_size: usize) -> usize {
        (addr - self.page_base(page_size)) / page_size
    }

    /// Page index for `addr`, or `None` if the segment has no page there.
    ///
    /// The inclusive upper bound of a segment ending on a page boundary
    /// matches an address one page past its last page.
    pub fn page_for(&self, addr: usize, page_size: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let index = self.page_index(addr, page_size);
        (index < self.page_count(page_size)).then_some(index)
    }

    /// First address of page `index`.
    pub fn page_start(&self, index: usize, page_size: usize) -> usize {
        self.page_base(page_size) + index * page_size
    }

    /// File-backed portion of page `index`, or `None` if the page is pure
    /// zero fill.
    pub fn file_window(&self, index: usize, page_size: usize) -> Option<FileWindow> {
        let page_start = self.page_start(index, page_size);
        let data_start = page_start.max(self.virtual_address);
        let data_end = (page_start + page_size).min(self.virtual_address + self.file_size);
        if data_start >= data_end {
            return None;
        }

        Some(FileWindow {
            file_offset: self.file_offset + (data_start - self.virtual_address) as u64,
            page_offset: data_start - page_start,
            len: data_end - data_start,
        })
    }

    /// Per-page residency state.
    pub fn residency(&self) -> &ResidencyMap {
        &self.residency
    }

    pub(crate) fn residency_mut(&mut self) -> &mut ResidencyMap {
        &mut self.residency
    }
}

/// Parsed representation of the target binary.
#[derive(Debug, Clone)]
pub struct ExecutableImage {
    /// Entry point of the program.
    pub entry_point: u64,
    /// Loadable segments in program-header order.
    pub segments: Vec<Segment>,
    /// In-memory program header table, reported through the aux vector.
    pub program_headers: ProgramHeaders,
}

impl ExecutableImage {
    pub fn new(entry_point: u64, segments: Vec<Segment>) -> Self {
        Self {
            entry_point,
            segments,
            program_headers: ProgramHeaders::default(),
        }
    }

    /// First segment with a page holding `addr`, and that page's index.
    pub fn find_segment(&self, addr: usize, page_size: usize) -> Option<(usize, usize)> {
        self.segments
            .iter()
            .enumerate()
            .find_map(|(i, s)| s.page_for(addr, page_size).map(|page| (i, page)))
    }

    /// Lowest and highest address covered by any segment.
    pub fn address_range(&self) -> Option<(usize, usize)> {
        let start = self.segments.iter().map(|s| s.virtual_address).min()?;
        let end = self
            .segments
            .iter()
            .map(|s| s.virtual_address + s.memory_size)
            .max()?;
        Some((start, end))
    }

    /// [`address_range`](Self::address_range) widened to whole pages, as
    /// `(start, len)`.
    pub fn page_span(&self, page_size: usize) -> Option<(usize, usize)> {
        let (start, end) = self.address_range()?;
        let start = align_down(start, page_size);
        let end = end.checked_next_multiple_of(page_size)?;
        Some((start, end - start))
    }
}
