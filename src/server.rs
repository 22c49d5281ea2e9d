//! TCP echo server.
//!
//! Binds the listening socket, runs the startup lifecycle, then accepts
//! connections forever and hands each one to the configured dispatcher.

use crate::config::ServerConfig;
use crate::counter::ConnectionCounter;
use crate::error::ServerError;
use crate::lifecycle;
use crate::listener;
use crate::runtime::{Connection, Dispatcher};
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{debug, info};

/// Server instance
pub struct Server {
    config: ServerConfig,
    counter: Arc<ConnectionCounter>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            counter: Arc::new(ConnectionCounter::new()),
        }
    }

    /// Get a reference to the connection counter for testing
    #[cfg(test)]
    pub fn counter(&self) -> &Arc<ConnectionCounter> {
        &self.counter
    }

    /// Bind, run the lifecycle steps, listen, and serve forever.
    ///
    /// Only returns on a fatal error.
    pub fn run(&self) -> Result<(), ServerError> {
        let bound = listener::bind(listener::bind_addr(&self.config)?)?;
        let addr = bound.local_addr();

        lifecycle::run(&self.config, &self.counter)?;

        let listener = bound.listen(self.config.backlog)?;
        info!(
            address = %addr,
            mode = ?self.config.mode,
            backlog = self.config.backlog,
            "Server listening"
        );

        self.serve(listener)
    }

    /// The accept loop. Has no normal exit.
    pub fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let dispatcher = Dispatcher::new(&self.config);
        dispatcher.prepare()?;

        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Accept(e)),
            };

            let total = self.counter.increment();
            info!(peer = %peer, total, "Connection received");

            let handle = dispatcher.dispatch(&listener, Connection::new(stream, peer))?;
            debug!(peer = %peer, ?handle, "Connection dispatched");
        }
    }
}
