//! End-to-end fault handling with real SIGSEGV delivery
//!
//! A sentinel handler is installed before the loader so it becomes the
//! "previous" disposition. It records every forwarded fault and makes the
//! faulting page read/write so the access can complete.
//!
//! Everything runs inside one test: the signal disposition and the active
//! context are process-wide.

mod common;

use core::{
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::fs::{self, File};

use demand_loader::{context, dispatcher, mm, ExecutableImage, Permissions, Segment};
use libc::{c_int, siginfo_t};

static FORWARDED: AtomicUsize = AtomicUsize::new(0);
static LAST_FORWARDED_ADDR: AtomicUsize = AtomicUsize::new(0);
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);

extern "C" fn sentinel(_signo: c_int, info: *mut siginfo_t, _ctx: *mut c_void) {
    // SAFETY: The kernel passes a valid siginfo_t to SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() as usize };
    FORWARDED.fetch_add(1, Ordering::SeqCst);
    LAST_FORWARDED_ADDR.store(addr, Ordering::SeqCst);

    let page = PAGE_SIZE.load(Ordering::SeqCst);
    let start = addr & !(page - 1);
    // SAFETY: Only pages reserved by this test are ever forwarded here.
    unsafe {
        libc::mprotect(
            start as *mut c_void,
            page,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
}

fn install_sentinel() {
    // SAFETY: sigaction is plain data.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction =
        sentinel as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;
    // SAFETY: `action` is a valid sigaction.
    let rc = unsafe { libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) };
    assert_eq!(rc, 0, "failed to install sentinel handler");
}

fn read_byte(addr: usize) -> u8 {
    // SAFETY: `addr` lies in a reservation owned by this test; faults on it
    // are resolved by the loader or the sentinel.
    unsafe { ptr::read_volatile(addr as *const u8) }
}

fn write_byte(addr: usize, value: u8) {
    // SAFETY: As for `read_byte`.
    unsafe { ptr::write_volatile(addr as *mut u8, value) }
}

#[test]
fn test_faults_are_serviced_or_forwarded() {
    let page = mm::page_size();
    PAGE_SIZE.store(page, Ordering::SeqCst);

    install_sentinel();
    dispatcher::install().unwrap();
    assert!(dispatcher::is_installed());
    assert!(matches!(
        dispatcher::next_handler(),
        Some(dispatcher::NextHandler::SigInfo(_))
    ));

    // Layout (in pages) of a six-page reservation:
    //   0..3  text segment: 1.5 pages from file offset 0, rest zero, read-only
    //   3..4  data segment: one page from file offset 2 pages, read/write
    //   5     reserved but outside every segment
    let backing = common::patterned(3 * page);
    let path = common::temp_file("faults", &backing);
    let file = File::open(&path).unwrap();

    let base = common::scratch_pages(6 * page);
    let text = Segment::new(base, 2 * page + page / 2, page + page / 2, 0, Permissions::READ);
    let data = Segment::new(
        base + 3 * page,
        page,
        page,
        2 * page as u64,
        Permissions::READ | Permissions::WRITE,
    );
    context::activate(ExecutableImage::new(base as u64, vec![text, data]), file);

    // Scenario A: first touches load file bytes and zero fill.
    assert_eq!(context::is_resident(base + 10), Some(false));
    assert_eq!(read_byte(base + 10), common::pattern(10));
    assert_eq!(context::is_resident(base + 10), Some(true));

    let past_file_data = base + page + page / 2 + 8;
    assert_eq!(read_byte(past_file_data), 0);
    assert_eq!(read_byte(base + page + 3), common::pattern(page + 3));
    assert_eq!(read_byte(base + 2 * page + 5), 0);

    let data_addr = base + 3 * page + 7;
    assert_eq!(read_byte(data_addr), common::pattern(2 * page + 7));
    write_byte(data_addr, 0x42);
    assert_eq!(read_byte(data_addr), 0x42);

    let stats = context::stats().unwrap();
    assert_eq!(stats.serviced, 4);
    assert_eq!(stats.bytes_read, (page + page / 2 + page) as u64);
    assert_eq!(FORWARDED.load(Ordering::SeqCst), 0);

    // Scenario C: writing a resident read-only page is a real violation.
    write_byte(base + 10, 0x99);
    assert_eq!(FORWARDED.load(Ordering::SeqCst), 1);
    assert_eq!(LAST_FORWARDED_ADDR.load(Ordering::SeqCst), base + 10);
    assert_eq!(read_byte(base + 10), 0x99);
    assert_eq!(context::stats().unwrap().already_resident, 1);

    // Scenario B: an address outside every segment is not ours.
    let outside = base + 5 * page;
    assert_eq!(context::is_resident(outside), None);
    assert_eq!(read_byte(outside), 0);
    assert_eq!(FORWARDED.load(Ordering::SeqCst), 2);
    assert_eq!(LAST_FORWARDED_ADDR.load(Ordering::SeqCst), outside);

    let stats = context::stats().unwrap();
    assert_eq!(stats.serviced, 4);
    assert_eq!(stats.not_ours, 1);

    let image = context::deactivate().unwrap();
    assert_eq!(image.segments[0].residency().resident_count(), 3);
    assert_eq!(image.segments[1].residency().resident_count(), 1);

    // SAFETY: The reservation is no longer referenced.
    unsafe { libc::munmap(base as *mut c_void, 6 * page) };
    fs::remove_file(&path).ok();
}
