//! Fatal server errors.
//!
//! Every variant names the operation that failed. `Display` renders
//! `<operation>: <os error>` so `main` can print `error: ...` and exit.

use std::io;
use std::net::SocketAddr;

/// An error the server cannot recover from.
#[derive(Debug)]
pub enum ServerError {
    /// Host/port did not form a socket address.
    Address(String),
    /// Socket allocation or option setup failed.
    Socket(io::Error),
    /// Binding to the address failed (usually already in use).
    Bind(SocketAddr, io::Error),
    /// Entering listening state failed.
    Listen(io::Error),
    /// A non-recoverable accept failure.
    Accept(io::Error),
    /// One step of the daemon transition failed.
    Daemon {
        step: &'static str,
        source: io::Error,
    },
    /// The run-as identity could not be resolved.
    Identity(String),
    /// Switching group or user id failed.
    Privilege(&'static str, io::Error),
    /// Installing a signal handler failed.
    Signal(&'static str, io::Error),
    /// Creating a worker process or thread failed.
    Spawn(&'static str, io::Error),
    /// An echo session hit an I/O error under the fatal policy.
    Session(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Address(addr) => write!(f, "invalid bind address '{addr}'"),
            ServerError::Socket(e) => write!(f, "socket: {e}"),
            ServerError::Bind(addr, e) => write!(f, "bind {addr}: {e}"),
            ServerError::Listen(e) => write!(f, "listen: {e}"),
            ServerError::Accept(e) => write!(f, "accept: {e}"),
            ServerError::Daemon { step, source } => write!(f, "daemonize ({step}): {source}"),
            ServerError::Identity(name) => write!(f, "unknown user '{name}'"),
            ServerError::Privilege(call, e) => write!(f, "{call}: {e}"),
            ServerError::Signal(name, e) => write!(f, "install {name} handler: {e}"),
            ServerError::Spawn(what, e) => write!(f, "spawn {what}: {e}"),
            ServerError::Session(peer, e) => write!(f, "session with {peer}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Address(_) | ServerError::Identity(_) => None,
            ServerError::Socket(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(e)
            | ServerError::Accept(e)
            | ServerError::Privilege(_, e)
            | ServerError::Signal(_, e)
            | ServerError::Spawn(_, e)
            | ServerError::Session(_, e) => Some(e),
            ServerError::Daemon { source, .. } => Some(source),
        }
    }
}

/// Print a fatal error to stderr and terminate the whole process.
///
/// Used from worker threads, which have no caller to return the error to.
pub fn die(err: &ServerError) -> ! {
    eprintln!("error: {err}");
    std::process::exit(libc::EXIT_FAILURE)
}
