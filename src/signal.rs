//! Interrupt handling.
//!
//! The first recorded reason wins; later raises are ignored.  The handler
//! only stores an atomic code (the async-signal-safe subset), and the main
//! thread's build-finished wait polls the reason on a short timeout.
//! Worker threads block SIGINT/SIGTERM so delivery lands on the main thread.

use std::sync::atomic::{AtomicU8, Ordering};

const REASON_NONE: u8 = 0;
const REASON_SIGINT: u8 = 1;
const REASON_SIGTERM: u8 = 2;
const REASON_CHILD_ABORTED: u8 = 3;

static REASON: AtomicU8 = AtomicU8::new(REASON_NONE);

fn set_code(code: u8) {
    // First raise wins.
    let _ = REASON.compare_exchange(REASON_NONE, code, Ordering::SeqCst, Ordering::SeqCst);
}

pub fn set_reason_child_aborted() {
    set_code(REASON_CHILD_ABORTED);
}

pub fn get_reason() -> Option<&'static str> {
    match REASON.load(Ordering::SeqCst) {
        REASON_SIGINT => Some("SIGINT received"),
        REASON_SIGTERM => Some("SIGTERM received"),
        REASON_CHILD_ABORTED => Some("child processes was aborted"),
        _ => None,
    }
}

/// Clear any recorded reason; a new build session starts clean.
pub fn reset() {
    REASON.store(REASON_NONE, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn signal_handler(sig: libc::c_int) {
    match sig {
        libc::SIGINT => set_code(REASON_SIGINT),
        libc::SIGTERM => set_code(REASON_SIGTERM),
        _ => {}
    }
}

/// Install the interrupt handlers.  Called before worker threads spawn so
/// the handler is in place for the whole build.
#[cfg(unix)]
pub fn install_handlers() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = signal_handler as libc::sighandler_t;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

/// Block interrupt signals on the calling (worker) thread, routing them to
/// the main thread.
#[cfg(unix)]
pub fn block_on_current_thread() {
    // Safety: manipulating the thread signal mask is libc unsafe code.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn install_handlers() {}

#[cfg(not(unix))]
pub fn block_on_current_thread() {}
