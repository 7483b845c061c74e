//! Host virtual-memory primitives
//!
//! The engine never calls `mmap`/`mprotect` directly; it goes through
//! [`PageMapper`] so page servicing can be exercised against plain buffers.

use core::{ffi::c_void, slice};
use std::io;

use super::Permissions;
use crate::error::{LoaderError, LoaderResult};

/// Installs page mappings on behalf of the demand-paging engine.
pub trait PageMapper {
    /// Establish a private, zero-filled, writable mapping of `len` bytes at
    /// `page_start` and return it for population.
    ///
    /// # Safety
    /// `page_start` must be page aligned and `len` a multiple of the page
    /// size. Any existing mapping in the range is replaced, so the range must
    /// not hold memory that is still referenced elsewhere.
    unsafe fn map_writable(&mut self, page_start: usize, len: usize) -> LoaderResult<&mut [u8]>;

    /// Change the protection of a mapping previously returned by
    /// [`map_writable`](Self::map_writable).
    ///
    /// # Safety
    /// No live reference into the range may be used afterwards in a way the
    /// new permissions forbid.
    unsafe fn protect(
        &mut self,
        page_start: usize,
        len: usize,
        permissions: Permissions,
    ) -> LoaderResult<()>;
}

/// [`PageMapper`] backed by the process's own address space.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMapper;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl PageMapper for HostMapper {
    unsafe fn map_writable(&mut self, page_start: usize, len: usize) -> LoaderResult<&mut [u8]> {
        // SAFETY: The caller guarantees the range is page aligned and free for
        // replacement. MAP_FIXED | MAP_ANONYMOUS yields zero-filled memory at
        // exactly `page_start`.
        let addr = unsafe {
            libc::mmap(
                page_start as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LoaderError::MapFailed {
                addr: page_start,
                errno: last_errno(),
            });
        }
        if addr as usize != page_start {
            return Err(LoaderError::InvalidState {
                expected: "fixed mapping at requested address",
                actual: "kernel placed mapping elsewhere",
            });
        }

        // SAFETY: mmap succeeded, so `len` readable and writable bytes start
        // at `addr`. The slice borrows `self`, and nothing else aliases the
        // freshly created mapping.
        Ok(unsafe { slice::from_raw_parts_mut(addr as *mut u8, len) })
    }

    unsafe fn protect(
        &mut self,
        page_start: usize,
        len: usize,
        permissions: Permissions,
    ) -> LoaderResult<()> {
        // SAFETY: The range was mapped by `map_writable`; the caller upholds
        // the aliasing requirement for the new protection.
        let rc = unsafe { libc::mprotect(page_start as *mut c_void, len, permissions.to_prot()) };
        if rc != 0 {
            return Err(LoaderError::ProtectFailed {
                addr: page_start,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

/// Claim `[start, start + len)` with no access rights.
///
/// Keeps later `mmap` calls and heap growth out of the image's address
/// range, so the fixed mappings made while servicing faults never replace
/// loader memory. Faults in the range still arrive as SIGSEGV. Fails if any
/// part of the range is already mapped.
pub fn reserve_range(start: usize, len: usize) -> LoaderResult<()> {
    // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping.
    let addr = unsafe {
        libc::mmap(
            start as *mut c_void,
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE
                | libc::MAP_ANONYMOUS
                | libc::MAP_NORESERVE
                | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::MapFailed {
            addr: start,
            errno: last_errno(),
        });
    }
    if addr as usize != start {
        // Kernels before 4.17 treat the flag as a hint.
        // SAFETY: `addr` is the mapping just created above.
        unsafe { libc::munmap(addr, len) };
        return Err(LoaderError::MapFailed {
            addr: start,
            errno: libc::EEXIST,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_size;

    /// Inaccessible pages at an address of the kernel's choosing.
    fn scratch(len: usize) -> usize {
        // SAFETY: A non-fixed anonymous mapping cannot clobber memory.
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        addr as usize
    }

    #[test]
    fn test_host_mapper_maps_zeroed_page_then_protects() {
        let page = page_size();
        let base = scratch(page);

        let mut mapper = HostMapper;
        // SAFETY: `base` is a page-aligned reservation owned by this test.
        let bytes = unsafe { mapper.map_writable(base, page) }.expect("map page");
        assert_eq!(bytes.len(), page);
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 0xAB;

        // SAFETY: `bytes` is not used after the page becomes read-only.
        unsafe { mapper.protect(base, page, Permissions::READ) }.expect("protect page");

        // SAFETY: The page is mapped readable.
        let first = unsafe { core::ptr::read_volatile(base as *const u8) };
        assert_eq!(first, 0xAB);

        // SAFETY: Unmapping the test's own reservation.
        unsafe { libc::munmap(base as *mut c_void, page) };
    }

    #[test]
    fn test_host_mapper_rejects_unaligned_address() {
        let page = page_size();
        let base = scratch(page * 2);

        let mut mapper = HostMapper;
        // SAFETY: The range lies inside this test's reservation; the kernel
        // rejects the misaligned MAP_FIXED request before touching it.
        let result = unsafe { mapper.map_writable(base + 1, page) };
        assert!(matches!(
            result,
            Err(LoaderError::MapFailed { errno, .. }) if errno == libc::EINVAL
        ));

        // SAFETY: Unmapping the test's own reservation.
        unsafe { libc::munmap(base as *mut c_void, page * 2) };
    }

    #[test]
    fn test_reserve_range_claims_free_range_once() {
        let page = page_size();
        let base = scratch(page * 2);
        // SAFETY: Releasing the test's own scratch pages to reuse the range.
        unsafe { libc::munmap(base as *mut c_void, page * 2) };

        reserve_range(base, page * 2).expect("range was just freed");
        assert!(matches!(
            reserve_range(base + page, page),
            Err(LoaderError::MapFailed { addr, errno }) if addr == base + page && errno == libc::EEXIST
        ));

        // SAFETY: Unmapping the test's own reservation.
        unsafe { libc::munmap(base as *mut c_void, page * 2) };
    }
}
