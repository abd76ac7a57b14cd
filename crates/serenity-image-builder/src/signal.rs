//! Interrupt handling for the driver.
//!
//! External commands run in their own process group. SIGINT and SIGTERM
//! raise a flag and are forwarded to that group, so the running step stops
//! right away; the executor then reports the interrupt. A SIGINT arriving
//! after the run was already interrupted exits immediately.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
// Process group of the command currently running, 0 when idle.
static CHILD_PGID: AtomicI32 = AtomicI32::new(0);

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Record the process group signals should be forwarded to.
pub(crate) fn track_child(pgid: u32) {
    CHILD_PGID.store(i32::try_from(pgid).unwrap_or(0), Ordering::SeqCst);
}

pub(crate) fn untrack_child() {
    CHILD_PGID.store(0, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn on_signal(sig: libc::c_int) {
    // Only async-signal-safe calls are allowed here.
    let already = INTERRUPTED.swap(true, Ordering::SeqCst);
    let pgid = CHILD_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        unsafe { libc::kill(-pgid, sig) };
    }
    if already && sig == libc::SIGINT {
        unsafe { libc::_exit(130) };
    }
}

#[cfg(unix)]
pub fn install_handlers() -> Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as *const () as libc::sighandler_t;
    for sig in [libc::SIGINT, libc::SIGTERM] {
        let prev = unsafe { libc::signal(sig, handler) };
        if prev == libc::SIG_ERR {
            return Err(Error::msg(format!(
                "failed to install handler for signal {sig}: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_handlers() -> Result<()> {
    Ok(())
}
