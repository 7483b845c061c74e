//! Fault Dispatcher
//!
//! Installs the process's SIGSEGV handler and routes each fault either to
//! the demand-paging engine or to whatever handler was installed before.
//! Routing only; all paging logic lives in [`crate::mm::demand_paging`].

use core::{ffi::c_void, fmt, mem, ptr};
use std::io;

use libc::{c_int, siginfo_t};
use log::{debug, info, warn};
use spin::{Mutex, Once};

use crate::{
    context,
    error::{LoaderError, LoaderResult},
    mm::ServiceResult,
};

/// `sa_handler` style handler.
pub type HandlerFn = extern "C" fn(c_int);

/// `sa_sigaction` style handler.
pub type SigInfoFn = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// Disposition that was active before [`install`] ran.
#[derive(Clone, Copy)]
pub enum NextHandler {
    /// `SIG_DFL`: the OS terminates the process.
    Default,
    /// `SIG_IGN`; treated like `Default` for a real access violation.
    Ignore,
    Handler(HandlerFn),
    SigInfo(SigInfoFn),
}

impl NextHandler {
    /// Decode a disposition returned by `sigaction`.
    pub fn from_action(action: &libc::sigaction) -> Self {
        let handler = action.sa_sigaction;
        if handler == libc::SIG_DFL {
            Self::Default
        } else if handler == libc::SIG_IGN {
            Self::Ignore
        } else if action.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: With SA_SIGINFO set, a non-sentinel sa_sigaction is the
            // address of a three-argument C handler.
            Self::SigInfo(unsafe { mem::transmute::<libc::sighandler_t, SigInfoFn>(handler) })
        } else {
            // SAFETY: Without SA_SIGINFO, a non-sentinel sa_handler is the
            // address of a one-argument C handler.
            Self::Handler(unsafe { mem::transmute::<libc::sighandler_t, HandlerFn>(handler) })
        }
    }
}

impl fmt::Debug for NextHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("SIG_DFL"),
            Self::Ignore => f.write_str("SIG_IGN"),
            Self::Handler(h) => write!(f, "handler@{:#x}", *h as usize),
            Self::SigInfo(h) => write!(f, "sigaction@{:#x}", *h as usize),
        }
    }
}

/// What the dispatcher does with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The page was serviced; return and let the instruction re-execute.
    Resume,
    /// Hand the fault to the previous handler.
    Forward,
}

static PREVIOUS: Once<libc::sigaction> = Once::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Register the SIGSEGV handler and remember the previous disposition.
///
/// Calling this again after a successful install does nothing.
pub fn install() -> LoaderResult<()> {
    let _guard = INSTALL_LOCK.lock();
    if PREVIOUS.is_completed() {
        return Ok(());
    }

    // SAFETY: sigaction is plain data; all-zero is a valid empty value.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = segv_handler as SigInfoFn as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;
    // SAFETY: sa_mask is a valid, owned sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: As above.
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    // SAFETY: Both pointers reference live sigaction values and
    // `segv_handler` has the SA_SIGINFO signature.
    let rc = unsafe { libc::sigaction(libc::SIGSEGV, &action, &mut previous) };
    if rc != 0 {
        return Err(LoaderError::SignalInstall {
            signal: libc::SIGSEGV,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }

    PREVIOUS.call_once(|| previous);
    info!(
        "SIGSEGV handler installed, previous disposition {:?}",
        NextHandler::from_action(&previous)
    );
    Ok(())
}

/// Whether [`install`] has completed.
pub fn is_installed() -> bool {
    PREVIOUS.is_completed()
}

/// The disposition faults are forwarded to.
pub fn next_handler() -> Option<NextHandler> {
    PREVIOUS.get().map(NextHandler::from_action)
}

/// Decide what to do with a fault. `service` is only consulted for SIGSEGV.
pub fn route<F>(signo: c_int, fault_address: usize, service: F) -> Route
where
    F: FnOnce(usize) -> LoaderResult<ServiceResult>,
{
    if signo != libc::SIGSEGV {
        return Route::Forward;
    }

    match service(fault_address) {
        Ok(ServiceResult::Serviced) => Route::Resume,
        Ok(ServiceResult::NotOurs) | Ok(ServiceResult::AlreadyResident) => Route::Forward,
        Err(err) => {
            warn!("fault at {:#x} not serviced: {}", fault_address, err);
            Route::Forward
        }
    }
}

extern "C" fn segv_handler(signo: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let fault_address = if info.is_null() {
        0
    } else {
        // SAFETY: The kernel passes a valid siginfo_t for SA_SIGINFO handlers.
        unsafe { (*info).si_addr() as usize }
    };

    if route(signo, fault_address, context::service_fault) == Route::Forward {
        // SAFETY: The arguments are the ones the kernel delivered.
        unsafe { forward(signo, fault_address, info, ucontext) };
    }
}

/// Pass a fault on to the previous disposition.
///
/// # Safety
/// Must be called from the signal handler with the arguments it received.
unsafe fn forward(signo: c_int, fault_address: usize, info: *mut siginfo_t, ucontext: *mut c_void) {
    let next = next_handler().unwrap_or(NextHandler::Default);
    debug!(
        "forwarding signal {} at {:#x} to {:?}",
        signo, fault_address, next
    );

    match next {
        NextHandler::SigInfo(handler) => handler(signo, info, ucontext),
        NextHandler::Handler(handler) => handler(signo),
        // Returning re-executes the access, which now gets default handling.
        NextHandler::Default | NextHandler::Ignore => restore_default(signo),
    }
}

fn restore_default(signo: c_int) {
    // SAFETY: sigaction is plain data; all-zero is SIG_DFL with no flags.
    let action: libc::sigaction = unsafe { mem::zeroed() };
    // SAFETY: `action` is a valid sigaction and the old value is discarded.
    unsafe { libc::sigaction(signo, &action, ptr::null_mut()) };
}
