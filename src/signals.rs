//! Signal / shutdown plane (§4.10): OS signal handlers set atomic flags
//! only, never touch the registry. The runtime observes these flags once
//! per loop iteration.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static RESET: AtomicBool = AtomicBool::new(false);
static PIPE_BROKE: AtomicBool = AtomicBool::new(false);
static CHILD_DIED: AtomicBool = AtomicBool::new(false);
static LAST_CHILD_PID: AtomicI32 = AtomicI32::new(0);
static NUKE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hup(_sig: libc::c_int) {
    RESET.store(true, Ordering::SeqCst);
}

extern "C" fn on_pipe(_sig: libc::c_int) {
    PIPE_BROKE.store(true, Ordering::SeqCst);
}

extern "C" fn on_chld(_sig: libc::c_int) {
    CHILD_DIED.store(true, Ordering::SeqCst);
}

/// SIGINT/SIGTERM: sets `nuke`, then restores the default disposition so a
/// second signal of the same kind terminates the process forcefully.
extern "C" fn on_nuke(sig: libc::c_int) {
    NUKE.store(true, Ordering::SeqCst);
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

unsafe fn install(signum: libc::c_int, handler: extern "C" fn(libc::c_int)) -> io::Result<()> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A handle proving the process-wide signal handlers are installed.
/// Zero-sized: all state lives in the statics above, since signal handlers
/// cannot close over anything.
pub struct SignalPlane {
    _private: (),
}

impl SignalPlane {
    /// Installs SIGHUP/SIGPIPE/SIGCHLD/SIGINT/SIGTERM handlers. Should be
    /// called exactly once, before entering the event loop.
    pub fn install() -> io::Result<Self> {
        unsafe {
            install(libc::SIGHUP, on_hup)?;
            install(libc::SIGPIPE, on_pipe)?;
            install(libc::SIGCHLD, on_chld)?;
            install(libc::SIGINT, on_nuke)?;
            install(libc::SIGTERM, on_nuke)?;
        }
        Ok(SignalPlane { _private: () })
    }

    pub fn take_reset(&self) -> bool {
        RESET.swap(false, Ordering::SeqCst)
    }

    pub fn take_pipe_broke(&self) -> bool {
        PIPE_BROKE.swap(false, Ordering::SeqCst)
    }

    pub fn take_child_died(&self) -> bool {
        CHILD_DIED.swap(false, Ordering::SeqCst)
    }

    pub fn is_nuked(&self) -> bool {
        NUKE.load(Ordering::SeqCst)
    }

    /// Non-blocking reap of zombie children (`waitpid(-1, WNOHANG)` in a
    /// loop), run in response to `child_died`. Returns `(pid, status)` for
    /// each child reaped this call.
    pub fn reap_children(&self) -> Vec<(libc::pid_t, libc::c_int)> {
        let mut reaped = Vec::new();
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            LAST_CHILD_PID.store(pid, Ordering::SeqCst);
            reaped.push((pid, status));
        }
        reaped
    }

    /// Restores default dispositions for every signal this plane installed
    /// (called once the loop has observed `nuke` and is exiting).
    pub fn restore_defaults(&self) {
        unsafe {
            for sig in [libc::SIGHUP, libc::SIGPIPE, libc::SIGCHLD, libc::SIGINT, libc::SIGTERM] {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Signal handlers are process-global state; these tests exercise the
    // flag-manipulation logic directly rather than raising real signals,
    // which would race with other tests in the same process.

    #[test]
    fn take_reset_clears_after_reading() {
        RESET.store(true, Ordering::SeqCst);
        let plane = SignalPlane { _private: () };
        assert!(plane.take_reset());
        assert!(!plane.take_reset());
    }

    #[test]
    fn reap_children_returns_empty_when_no_children() {
        let plane = SignalPlane { _private: () };
        // No children exist in the test process, so WNOHANG must return
        // immediately with no entries rather than blocking.
        assert!(plane.reap_children().is_empty());
    }
}
