//! Accepted connections and the workers that own them.
//!
//! A `Connection` is moved, never borrowed, into whichever worker runs its
//! session, so exactly one execution context can touch the stream.

use crate::session::{self, SessionStats};
use std::io;
use std::net::{SocketAddr, TcpStream};

/// One accepted peer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run the echo session to completion, consuming (and closing) the stream.
    ///
    /// With `mirror` set, received bytes are copied to stdout.
    pub fn serve(self, mirror: bool) -> io::Result<SessionStats> {
        if mirror {
            session::run(self.stream, self.peer, &mut io::stdout())
        } else {
            session::run(self.stream, self.peer, &mut io::sink())
        }
    }
}

/// How a connection was handed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerHandle {
    /// The session already ran on the accept loop.
    Inline(SessionStats),
    /// A forked child owns the connection; the reaper collects it.
    Process { pid: libc::pid_t },
    /// A detached thread owns the connection and is never joined.
    Thread { name: String },
}
