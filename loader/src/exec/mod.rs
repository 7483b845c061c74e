//! Program start
//!
//! Maps a fresh stack, lays out argc/argv/envp/auxv on it and transfers
//! control to the loaded program's entry point. Nothing of the program is
//! mapped beforehand: the very first instruction fetch faults and is
//! serviced by the demand-paging engine.

pub mod auxv;

use core::{convert::Infallible, ptr, slice};
use std::{
    ffi::{CStr, CString, OsString},
    io,
    os::unix::ffi::OsStrExt,
};

use log::info;

pub use self::auxv::{build_aux_vector, layout_stack, AuxType, AuxVecEntry, StackWriter};
use crate::{
    error::{LoaderError, LoaderResult},
    image::ExecutableImage,
};

/// What the initial stack needs to know about the image.
///
/// Copied out of the [`ExecutableImage`] before the image moves into the
/// process-scoped context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub entry_point: u64,
    pub phdr_address: u64,
    pub phdr_entry_size: u16,
    pub phdr_count: u16,
    pub page_size: usize,
}

impl EntryInfo {
    pub fn from_image(image: &ExecutableImage, page_size: usize) -> Self {
        Self {
            entry_point: image.entry_point,
            phdr_address: image.program_headers.address,
            phdr_entry_size: image.program_headers.entry_size,
            phdr_count: image.program_headers.count,
            page_size,
        }
    }
}

/// Convert OS strings to C strings, rejecting interior NULs.
pub fn to_cstrings<I, S>(items: I) -> LoaderResult<Vec<CString>>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items
        .into_iter()
        .map(|item| {
            CString::new(item.into().as_bytes()).map_err(|_| LoaderError::InvalidArgument {
                name: "argv",
                value: "contains an interior NUL byte",
            })
        })
        .collect()
}

/// Current environment as `KEY=VALUE` C strings.
fn environment() -> Vec<CString> {
    std::env::vars_os()
        .filter_map(|(key, value)| {
            let mut pair = key.as_bytes().to_vec();
            pair.push(b'=');
            pair.extend_from_slice(value.as_bytes());
            CString::new(pair).ok()
        })
        .collect()
}

fn random_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    let mut filled = 0;
    while filled < bytes.len() {
        // SAFETY: The destination is the unfilled tail of `bytes`.
        let n = unsafe {
            libc::getrandom(
                bytes[filled..].as_mut_ptr().cast(),
                bytes.len() - filled,
                0,
            )
        };
        if n <= 0 {
            // AT_RANDOM only seeds canaries; fall back to the clock.
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // SAFETY: `ts` is a valid timespec.
            unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            let seed = (ts.tv_sec as u64) ^ ((ts.tv_nsec as u64) << 20);
            bytes[..8].copy_from_slice(&seed.to_ne_bytes());
            bytes[8..].copy_from_slice(&seed.rotate_left(29).to_ne_bytes());
            break;
        }
        filled += n as usize;
    }
    bytes
}

/// Map a read/write stack of `size` bytes and return its lowest address.
fn map_stack(size: usize) -> LoaderResult<usize> {
    // SAFETY: A non-fixed anonymous mapping cannot clobber existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(LoaderError::MapFailed {
            addr: 0,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    Ok(addr as usize)
}

/// Build the initial stack and jump to the program's entry point.
///
/// `argv[0]` conventionally names the program; `execfn` is reported through
/// `AT_EXECFN`. Only returns on failure.
pub fn start_execution(
    entry: &EntryInfo,
    execfn: &CStr,
    argv: &[CString],
    stack_size: usize,
) -> LoaderResult<Infallible> {
    if !cfg!(target_arch = "x86_64") {
        return Err(LoaderError::OperationNotSupported {
            operation: "start_execution on this architecture",
        });
    }

    let env = environment();
    let argv: Vec<&CStr> = argv.iter().map(CString::as_c_str).collect();
    let envp: Vec<&CStr> = env.iter().map(CString::as_c_str).collect();

    let base = map_stack(stack_size)?;
    // SAFETY: `map_stack` returned a fresh read/write mapping of
    // `stack_size` bytes that nothing else references.
    let mem = unsafe { slice::from_raw_parts_mut(base as *mut u8, stack_size) };
    let sp = layout_stack(mem, base, entry, &argv, &envp, execfn, &random_bytes())?;

    info!(
        "starting program at {:#x}, stack {:#x}, argc {}",
        entry.entry_point,
        sp,
        argv.len()
    );

    // SAFETY: `sp` points at a complete initial stack inside a live mapping,
    // and the entry point lies in a segment of the active image, so the
    // first fetch is serviced by the fault handler.
    unsafe { jump_to_entry(entry.entry_point, sp) }
}

/// Replace the current stack and continue at `entry`.
///
/// # Safety
/// `stack_pointer` must be 16-byte aligned and point at argc of a valid
/// initial process stack. `entry` must be code that never returns.
#[cfg(target_arch = "x86_64")]
unsafe fn jump_to_entry(entry: u64, stack_pointer: u64) -> ! {
    // SAFETY: The caller guarantees the stack layout. rdx = 0 tells the
    // program there is no exit handler to register; rbp = 0 marks the
    // outermost frame.
    unsafe {
        core::arch::asm!(
            "mov rsp, rsi",
            "xor edx, edx",
            "xor ebp, ebp",
            "jmp rax",
            in("rax") entry,
            in("rsi") stack_pointer,
            options(noreturn)
        )
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn jump_to_entry(_entry: u64, _stack_pointer: u64) -> ! {
    // start_execution rejects other architectures before reaching here.
    unreachable!("no entry trampoline for this architecture")
}
