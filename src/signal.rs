//! Fault signal dispatch.
//!
//! One SIGSEGV handler serves the whole process: faults inside the global
//! range enter the coherence engine, everything else chains to whatever
//! handler the application had installed before (or installs later
//! through [`install_application_handler`]).
//!
//! The coherence path acquires ordinary mutexes from signal context, which
//! is not async-signal-safe; the runtime therefore must never fault while
//! holding them. A nested fault while one is being serviced indicates
//! exactly that and aborts the process.

use crate::error::{Error, Result};
use crate::runtime::try_runtime;
use std::cell::Cell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether the runtime handler has been installed.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The handler the application had before init (or installed after).
/// Written under `PREVIOUS_LOCK`, read lock-free from the handler.
static mut PREVIOUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static PREVIOUS_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

thread_local! {
    /// Set while this thread services a fault.
    static IN_FAULT: Cell<bool> = const { Cell::new(false) };
}

/// Install the runtime's fault handler. Called once from init, before any
/// global memory access is possible.
pub(crate) fn install_runtime_handler() -> Result<()> {
    let _guard = PREVIOUS_LOCK.lock();
    // SAFETY: zeroed sigaction is a valid "empty" template.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = dispatch as usize;
    action.sa_flags = libc::SA_SIGINFO;
    // SAFETY: installing a process signal handler with valid arguments;
    // the previous action is saved for chaining.
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(
            libc::SIGSEGV,
            &action,
            (&raw mut PREVIOUS).cast::<libc::sigaction>(),
        )
    };
    if rc != 0 {
        return Err(Error::Config("cannot install the fault handler".into()));
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// Install an application handler for the fault signal.
///
/// The handler is only invoked for faults outside the global range.
/// Returns the previously installed application handler. Fails with
/// [`Error::HandlerOrder`] when the runtime has not captured the signal
/// yet: installing directly via `sigaction` at that point would disconnect
/// the coherence engine.
pub fn install_application_handler(action: &libc::sigaction) -> Result<libc::sigaction> {
    if !INSTALLED.load(Ordering::Acquire) {
        return Err(Error::HandlerOrder);
    }
    let _guard = PREVIOUS_LOCK.lock();
    // SAFETY: PREVIOUS is initialized once INSTALLED is set, and the lock
    // serializes writers.
    unsafe {
        let previous = (&raw mut PREVIOUS).cast::<libc::sigaction>();
        let old = previous.read();
        previous.write(*action);
        Ok(old)
    }
}

/// The process-wide SIGSEGV entry point.
extern "C" fn dispatch(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let fault_addr = unsafe { (*info).si_addr() as usize };

    if let Some(rt) = try_runtime() {
        if rt.vm.contains(fault_addr) {
            let nested = IN_FAULT.with(|flag| flag.replace(true));
            if nested {
                // Faulted while servicing a fault: the handler itself
                // touched unmapped global memory. Unrecoverable.
                rt_abort(b"fatal: nested fault inside the coherence handler\n");
            }
            crate::coherence::handle_fault(rt, fault_addr);
            IN_FAULT.with(|flag| flag.set(false));
            return;
        }
    }
    chain_to_application(signum, info, context);
}

/// Forward a non-global fault to the application's handler, preserving
/// sigaction semantics for both handler styles.
fn chain_to_application(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // SAFETY: PREVIOUS was written by install_runtime_handler before any
    // fault can reach this point. The racy read against a concurrent
    // install_application_handler yields either handler, both valid.
    let previous = unsafe { (&raw const PREVIOUS).cast::<libc::sigaction>().read() };

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: the application registered this three-argument handler.
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(signum, info, context);
        return;
    }
    match previous.sa_sigaction {
        libc::SIG_IGN => {}
        libc::SIG_DFL => {
            // Restore the default action and return; the faulting
            // instruction re-executes and the default disposition fires.
            // SAFETY: resetting to SIG_DFL is always valid.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(signum, &action, std::ptr::null_mut());
            }
        }
        handler => {
            // SAFETY: the application registered this one-argument handler.
            let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            handler(signum);
        }
    }
}

/// Write a message and abort, without allocating.
fn rt_abort(message: &[u8]) -> ! {
    // SAFETY: write(2) with a valid buffer; abort never returns.
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::abort();
    }
}
