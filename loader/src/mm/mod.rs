//! Memory management for the loaded image
//!
//! Page geometry, segment permissions, and the host mapping primitives used
//! by the demand-paging engine.

pub mod demand_paging;
pub mod mapper;

use bitflags::bitflags;

pub use demand_paging::{DemandPager, PageSource, PagingStats, ResidencyMap, ServiceResult};
pub use mapper::{HostMapper, PageMapper};

/// Fallback used when `sysconf` cannot report the page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: spin::Once<usize> = spin::Once::new();

/// Host page size in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            DEFAULT_PAGE_SIZE
        }
    })
}

/// Round `addr` down to a multiple of `page_size` (a power of two).
#[inline]
pub fn align_down(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

bitflags! {
    /// Access permissions applied to a segment's pages once their content is
    /// in place. Bit values match the ELF `PF_X`, `PF_W` and `PF_R` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl Permissions {
    /// Decode the `p_flags` field of a program header. Unknown bits are
    /// dropped.
    pub fn from_elf_flags(p_flags: u32) -> Self {
        Self::from_bits_truncate(p_flags)
    }

    /// Protection bits for `mmap`/`mprotect`.
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}
