//! One-shot startup steps run between bind and listen.
//!
//! Order matters: detach first, then drop privileges, then start the
//! connection-count reporter. The reporter is the first extra thread, so the
//! two `fork` calls of the daemon transition happen while the process is
//! still single-threaded.

use crate::config::ServerConfig;
use crate::counter::ConnectionCounter;
use crate::error::ServerError;
use std::ffi::CString;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::info;

/// Identity used when started as root without a configured user.
pub const DEFAULT_USER: &str = "nobody";

/// Held across `fork` and by the reporter while it logs.
///
/// A forked child only inherits the forking thread, so no other thread may
/// be inside a stdout lock at that moment.
static FORK_GUARD: Mutex<()> = Mutex::new(());

pub fn fork_guard() -> MutexGuard<'static, ()> {
    FORK_GUARD.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run every configured startup step, in order.
pub fn run(config: &ServerConfig, counter: &Arc<ConnectionCounter>) -> Result<(), ServerError> {
    if config.should_daemonize() {
        daemonize()?;
    }

    if let Some(identity) = drop_privileges(config.user.as_deref())? {
        info!(uid = identity.uid, gid = ?identity.gid, "Dropped privileges");
    }

    spawn_reporter(Arc::clone(counter), config.report_delay, config.report_interval)?;
    Ok(())
}

fn daemon_err(step: &'static str) -> ServerError {
    ServerError::Daemon {
        step,
        source: io::Error::last_os_error(),
    }
}

/// Detach from the controlling terminal.
///
/// The surviving process is the grandchild: it is not a session leader, so it
/// can never reacquire a terminal, and it is reparented to init.
pub fn daemonize() -> Result<(), ServerError> {
    unsafe {
        if libc::chdir(b"/\0".as_ptr().cast()) < 0 {
            return Err(daemon_err("chdir /"));
        }

        let null = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
        if null < 0 {
            return Err(daemon_err("open /dev/null"));
        }
        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(null, fd) < 0 {
                return Err(daemon_err("dup2"));
            }
        }
        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
    }

    fork_and_exit_parent("fork")?;

    unsafe {
        if libc::setsid() < 0 {
            return Err(daemon_err("setsid"));
        }
        if libc::signal(libc::SIGHUP, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(daemon_err("ignore SIGHUP"));
        }
    }

    fork_and_exit_parent("second fork")
}

fn fork_and_exit_parent(step: &'static str) -> Result<(), ServerError> {
    match unsafe { libc::fork() } {
        -1 => Err(daemon_err(step)),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

/// A resolved run-as identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: libc::uid_t,
    /// Primary group, when the password database knows the user.
    pub gid: Option<libc::gid_t>,
}

/// Look up a user name or numeric uid in the password database.
///
/// A numeric uid without a database entry is accepted as-is, without a group.
pub fn resolve_identity(user: &str) -> Result<Identity, ServerError> {
    let numeric = user.parse::<libc::uid_t>().ok();

    let entry = match numeric {
        Some(uid) => unsafe { libc::getpwuid(uid) },
        None => {
            let name = CString::new(user).map_err(|_| ServerError::Identity(user.to_string()))?;
            unsafe { libc::getpwnam(name.as_ptr()) }
        }
    };

    if entry.is_null() {
        return match numeric {
            Some(uid) => Ok(Identity { uid, gid: None }),
            None => Err(ServerError::Identity(user.to_string())),
        };
    }

    let (uid, gid) = unsafe { ((*entry).pw_uid, (*entry).pw_gid) };
    Ok(Identity {
        uid,
        gid: Some(gid),
    })
}

/// Switch to an unprivileged identity if running as root.
///
/// Returns the identity switched to, or `None` when not running as root.
/// The switch cannot be undone.
pub fn drop_privileges(user: Option<&str>) -> Result<Option<Identity>, ServerError> {
    drop_privileges_as(unsafe { libc::geteuid() }, user)
}

fn drop_privileges_as(
    euid: libc::uid_t,
    user: Option<&str>,
) -> Result<Option<Identity>, ServerError> {
    if euid != 0 {
        return Ok(None);
    }

    let identity = resolve_identity(user.unwrap_or(DEFAULT_USER))?;

    unsafe {
        if let Some(gid) = identity.gid {
            if libc::setgroups(0, std::ptr::null()) < 0 {
                return Err(ServerError::Privilege("setgroups", io::Error::last_os_error()));
            }
            if libc::setgid(gid) < 0 {
                return Err(ServerError::Privilege("setgid", io::Error::last_os_error()));
            }
        }
        if libc::setuid(identity.uid) < 0 {
            return Err(ServerError::Privilege("setuid", io::Error::last_os_error()));
        }
    }

    Ok(Some(identity))
}

/// One periodic report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Connections accepted since process start.
    pub total: u64,
    /// Connections accepted since the previous report.
    pub since_last: u64,
}

/// Reads the counter and remembers the previous total.
pub struct Reporter {
    counter: Arc<ConnectionCounter>,
    last: u64,
}

impl Reporter {
    pub fn new(counter: Arc<ConnectionCounter>) -> Self {
        Self { counter, last: 0 }
    }

    pub fn report(&mut self) -> Report {
        let total = self.counter.snapshot();
        let since_last = total - self.last;
        self.last = total;
        Report { total, since_last }
    }
}

/// Start the periodic connection-count reporter.
///
/// First report after `delay`, then every `interval`. A zero interval
/// disables reporting.
pub fn spawn_reporter(
    counter: Arc<ConnectionCounter>,
    delay: Duration,
    interval: Duration,
) -> Result<(), ServerError> {
    if interval.is_zero() {
        return Ok(());
    }

    let mut reporter = Reporter::new(counter);
    thread::Builder::new()
        .name("reporter".to_string())
        .spawn(move || {
            thread::sleep(delay);
            loop {
                let report = reporter.report();
                {
                    let _guard = fork_guard();
                    info!(
                        total = report.total,
                        since_last = report.since_last,
                        "Connection count"
                    );
                }
                thread::sleep(interval);
            }
        })
        .map_err(|e| ServerError::Spawn("reporter thread", e))?;

    Ok(())
}
