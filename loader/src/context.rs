//! Process-scoped loader context
//!
//! The fault handler has no way to receive arguments from the code that
//! started the program, so the active image, its backing file and the page
//! mapper are grouped into one [`LoaderContext`] stored behind a
//! [`spin::Mutex`]. The fault path only ever uses `try_lock`, so a fault
//! raised while the context is held is forwarded instead of deadlocking.

use std::fs::File;

use log::info;
use spin::Mutex;

use crate::{
    error::{LoaderError, LoaderResult},
    image::ExecutableImage,
    mm::{self, DemandPager, HostMapper, PagingStats, ServiceResult},
};

/// Engine bound to the real executable file and the host address space.
pub type LoaderContext = DemandPager<File, HostMapper>;

static ACTIVE: Mutex<Option<LoaderContext>> = Mutex::new(None);

/// Make `image` the image serviced by the fault handler, backed by `file`.
///
/// Replaces any previously active image.
pub fn activate(image: ExecutableImage, file: File) {
    let segments = image.segments.len();
    let context = DemandPager::new(image, file, HostMapper, mm::page_size());
    *ACTIVE.lock() = Some(context);
    info!(
        "image with {} segments active, page size {}",
        segments,
        mm::page_size()
    );
}

/// Drop the active image. Its pages stay mapped.
pub fn deactivate() -> Option<ExecutableImage> {
    ACTIVE.lock().take().map(|ctx| ctx.image().clone())
}

/// Service a fault against the active image.
pub fn service_fault(fault_address: usize) -> LoaderResult<ServiceResult> {
    let Some(mut guard) = ACTIVE.try_lock() else {
        return Err(LoaderError::InvalidState {
            expected: "idle loader context",
            actual: "fault raised while servicing a fault",
        });
    };
    let context = guard.as_mut().ok_or(LoaderError::NotInitialized {
        subsystem: "loader context",
    })?;
    context.service_fault(fault_address)
}

/// Run `f` with the active context, if any.
pub fn with_context<R, F: FnOnce(&LoaderContext) -> R>(f: F) -> Option<R> {
    ACTIVE.lock().as_ref().map(f)
}

/// Fault counters of the active image.
pub fn stats() -> Option<PagingStats> {
    with_context(|ctx| ctx.stats())
}

/// Residency of the page holding `addr` in the active image.
pub fn is_resident(addr: usize) -> Option<bool> {
    with_context(|ctx| ctx.is_resident(addr)).flatten()
}
