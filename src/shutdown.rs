//! Signal-driven cancellation.
//!
//! SIGINT/SIGTERM set a shared flag. The handler is installed without
//! SA_RESTART so a blocked poll returns `Interrupted`, which the reactor
//! treats as an empty batch and then observes the flag.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static CANCEL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signum: libc::c_int) {
    // Only async-signal-safe work here: a single atomic store.
    if let Some(flag) = CANCEL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGINT and SIGTERM to `flag`. May be installed once per process.
pub fn install(flag: Arc<AtomicBool>) -> io::Result<()> {
    CANCEL_FLAG
        .set(flag)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "signal handler installed twice"))?;

    let handler: extern "C" fn(libc::c_int) = on_signal;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}
