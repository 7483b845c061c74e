//! Demand-paging loader for statically linked ELF64 executables
//!
//! Nothing of the target program is mapped up front. Every access to a
//! not-yet-present page of one of its segments raises SIGSEGV; the fault
//! dispatcher hands the address to the demand-paging engine, which maps
//! exactly that page, fills it from the executable file (zero-filling the
//! rest) and applies the segment's permissions. The faulting instruction
//! then re-executes. Faults outside the image go to whatever handler was
//! installed before the loader.
//!
//! ```no_run
//! use demand_loader::{LoaderConfig, execute, init_loader};
//!
//! init_loader()?;
//! execute("/usr/local/bin/hello", &["hello"], &LoaderConfig::default())?;
//! # Ok::<(), demand_loader::LoaderError>(())
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod elf;
pub mod error;
pub mod exec;
pub mod image;
pub mod logger;
pub mod mm;

use core::convert::Infallible;
use std::{
    ffi::{CString, OsStr},
    fs::File,
    os::unix::ffi::OsStrExt,
    path::Path,
};

use log::{debug, info};

pub use crate::{
    config::LoaderConfig,
    context::{activate, deactivate, is_resident, stats},
    error::{ElfError, LoaderError, LoaderResult},
    exec::EntryInfo,
    image::{ExecutableImage, Segment},
    mm::{PagingStats, Permissions, ServiceResult},
};

/// Install the fault dispatcher. Safe to call more than once.
pub fn init_loader() -> LoaderResult<()> {
    dispatcher::install()
}

/// Parse the executable at `path`, reserve its address range and make it
/// the active image, without starting it.
pub fn prepare(path: &Path) -> LoaderResult<EntryInfo> {
    let image = elf::parse_executable(path)?;
    let file = File::open(path).map_err(|e| LoaderError::io("open executable", &e))?;
    let page_size = mm::page_size();
    let (start, len) = image.page_span(page_size).ok_or(LoaderError::Elf(
        ElfError::NoLoadableSegments,
    ))?;
    mm::mapper::reserve_range(start, len)?;
    debug!("reserved {:#x}..{:#x} for the image", start, start + len);

    let entry = EntryInfo::from_image(&image, page_size);
    activate(image, file);
    Ok(entry)
}

/// Load and run the executable at `path` with the given `argv`.
///
/// [`init_loader`] must have run first. Only returns on failure; once the
/// program starts it owns the process.
pub fn execute<P, A>(path: P, argv: &[A], config: &LoaderConfig) -> LoaderResult<Infallible>
where
    P: AsRef<Path>,
    A: AsRef<OsStr>,
{
    if !dispatcher::is_installed() {
        return Err(LoaderError::NotInitialized {
            subsystem: "fault dispatcher",
        });
    }
    config.validate()?;

    let path = path.as_ref();
    let argv = exec::to_cstrings(argv.iter().map(|a| a.as_ref()))?;
    let execfn = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        LoaderError::InvalidArgument {
            name: "path",
            value: "contains an interior NUL byte",
        }
    })?;

    let entry = prepare(path)?;
    info!("executing {}", path.display());
    exec::start_execution(&entry, &execfn, &argv, config.stack_size)
}
