//! Listening socket bootstrap.
//!
//! Binding and listening are separate steps: the lifecycle controller runs
//! between them (daemon transition and privilege drop happen on a bound but
//! not yet listening socket).

use crate::config::ServerConfig;
use crate::error::ServerError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, TcpListener};
use tracing::debug;

/// A socket bound to its address that is not yet accepting connections.
pub struct BoundSocket {
    socket: Socket,
    addr: SocketAddr,
}

/// Resolve the configured host and port into a socket address.
pub fn bind_addr(config: &ServerConfig) -> Result<SocketAddr, ServerError> {
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|_| ServerError::Address(config.host.clone()))?;
    Ok(SocketAddr::new(ip, config.port))
}

/// Create a stream socket with `SO_REUSEADDR` and bind it to `addr`.
pub fn bind(addr: SocketAddr) -> Result<BoundSocket, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;

    // Report the real port when binding to port 0.
    let addr = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or(addr);

    debug!(addr = %addr, "Socket bound");
    Ok(BoundSocket { socket, addr })
}

impl BoundSocket {
    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Enter listening state and hand back a blocking std listener.
    pub fn listen(self, backlog: i32) -> Result<TcpListener, ServerError> {
        self.socket.listen(backlog).map_err(ServerError::Listen)?;
        Ok(self.socket.into())
    }
}
