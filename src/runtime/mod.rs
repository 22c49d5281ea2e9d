//! Concurrency dispatch for accepted connections.
//!
//! One strategy is chosen at startup and never changes:
//! - Inline: the session runs on the accept loop itself
//! - Process: a forked child per connection, reaped on `SIGCHLD`
//! - Thread: a detached thread per connection, optionally bounded
//!
//! Every strategy takes the `Connection` by value, so ownership of the stream
//! moves exactly once.

mod connection;
mod process;
mod thread;

pub(crate) use connection::{Connection, WorkerHandle};
pub(crate) use process::{install_reaper, ProcessDispatcher};
pub(crate) use thread::ThreadDispatcher;

use crate::config::{ConcurrencyMode, ServerConfig, SessionErrorPolicy};
use crate::error::ServerError;
use crate::session::SessionStats;
use std::io;
use std::net::{SocketAddr, TcpListener};
use tracing::warn;

/// Per-session settings copied into every worker.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub mirror: bool,
    pub policy: SessionErrorPolicy,
}

impl SessionContext {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            mirror: config.mirror_payload,
            policy: config.error_policy,
        }
    }

    /// Apply the error policy to a finished session.
    ///
    /// Under `Close` a failed session is logged and reported as empty.
    pub fn finish(
        &self,
        peer: SocketAddr,
        result: io::Result<SessionStats>,
    ) -> Result<SessionStats, ServerError> {
        match result {
            Ok(stats) => Ok(stats),
            Err(e) => match self.policy {
                SessionErrorPolicy::Fatal => Err(ServerError::Session(peer, e)),
                SessionErrorPolicy::Close => {
                    warn!(peer = %peer, error = %e, "Session failed, connection closed");
                    Ok(SessionStats::default())
                }
            },
        }
    }
}

/// The active dispatch strategy.
pub enum Dispatcher {
    Inline(SessionContext),
    Process(ProcessDispatcher),
    Thread(ThreadDispatcher),
}

impl Dispatcher {
    pub fn new(config: &ServerConfig) -> Self {
        let context = SessionContext::from_config(config);
        match config.mode {
            ConcurrencyMode::Inline => Dispatcher::Inline(context),
            ConcurrencyMode::Process => Dispatcher::Process(ProcessDispatcher::new(context)),
            ConcurrencyMode::Thread => {
                Dispatcher::Thread(ThreadDispatcher::new(context, config.max_workers))
            }
        }
    }

    /// One-time setup before the first accept.
    pub fn prepare(&self) -> Result<(), ServerError> {
        match self {
            Dispatcher::Process(_) => install_reaper(),
            Dispatcher::Inline(_) | Dispatcher::Thread(_) => Ok(()),
        }
    }

    /// Hand off one connection. Only `Inline` waits for the session to end.
    pub fn dispatch(
        &self,
        listener: &TcpListener,
        conn: Connection,
    ) -> Result<WorkerHandle, ServerError> {
        match self {
            Dispatcher::Inline(context) => {
                let peer = conn.peer();
                let stats = context.finish(peer, conn.serve(context.mirror))?;
                Ok(WorkerHandle::Inline(stats))
            }
            Dispatcher::Process(process) => process.dispatch(listener, conn),
            Dispatcher::Thread(thread) => thread.dispatch(conn),
        }
    }
}
