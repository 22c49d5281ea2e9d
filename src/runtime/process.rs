//! Process-per-connection dispatch and the `SIGCHLD` reaper.
//!
//! The parent forks, drops its copy of the connection and goes straight back
//! to accepting. The child closes the listener, runs the session and leaves
//! with `_exit`; it never returns into the accept loop.

use super::{Connection, SessionContext, WorkerHandle};
use crate::error::ServerError;
use crate::lifecycle::fork_guard;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error};

/// Forked workers not yet reaped. Decremented from the signal handler.
static LIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

pub fn live_workers() -> usize {
    LIVE_WORKERS.load(Ordering::Relaxed)
}

/// Forks one child per connection.
#[derive(Debug, Clone, Copy)]
pub struct ProcessDispatcher {
    context: SessionContext,
}

impl ProcessDispatcher {
    pub fn new(context: SessionContext) -> Self {
        Self { context }
    }

    pub fn dispatch(
        &self,
        listener: &TcpListener,
        conn: Connection,
    ) -> Result<WorkerHandle, ServerError> {
        // Counted before the fork: the child may exit and be reaped before
        // `fork` even returns in the parent.
        LIVE_WORKERS.fetch_add(1, Ordering::Relaxed);

        let forked = {
            let _guard = fork_guard();
            match unsafe { libc::fork() } {
                -1 => Err(io::Error::last_os_error()),
                pid => Ok(pid),
            }
        };

        match forked {
            Err(e) => {
                LIVE_WORKERS.fetch_sub(1, Ordering::Relaxed);
                Err(ServerError::Spawn("process worker", e))
            }
            Ok(0) => self.run_child(listener, conn),
            Ok(pid) => {
                // The child owns the connection now.
                drop(conn);
                debug!(pid, live = live_workers(), "Forked worker");
                Ok(WorkerHandle::Process { pid })
            }
        }
    }

    fn run_child(&self, listener: &TcpListener, conn: Connection) -> ! {
        // The TcpListener destructor never runs in the child, so this is the
        // only close of its copy.
        unsafe { libc::close(listener.as_raw_fd()) };

        let peer = conn.peer();
        let status = match self.context.finish(peer, conn.serve(self.context.mirror)) {
            Ok(_) => libc::EXIT_SUCCESS,
            Err(e) => {
                error!(error = %e, "Worker failed");
                eprintln!("error: {e}");
                libc::EXIT_FAILURE
            }
        };

        unsafe { libc::_exit(status) }
    }
}

/// Install the `SIGCHLD` handler that reaps every terminated child.
pub fn install_reaper() -> Result<(), ServerError> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigchld as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) < 0 {
            return Err(ServerError::Signal("SIGCHLD", io::Error::last_os_error()));
        }
    }
    Ok(())
}

extern "C" fn on_sigchld(_signal: libc::c_int) {
    // waitpid clobbers errno, and the interrupted code may be about to read it.
    let saved = unsafe { *errno_location() };
    reap_all();
    unsafe { *errno_location() = saved };
}

/// Collect every child that has already terminated, without blocking.
///
/// Several exits can collapse into one pending `SIGCHLD`, so this loops until
/// `waitpid` reports nothing left. Async-signal-safe.
pub fn reap_all() -> usize {
    let mut reaped = 0;
    let mut status: libc::c_int = 0;

    while unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) } > 0 {
        reaped += 1;
        let _ = LIVE_WORKERS.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_sub(1)
        });
    }

    reaped
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}
