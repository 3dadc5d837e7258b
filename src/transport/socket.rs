//! Socket construction for listen and upstream endpoints
//!
//! Both directions go through socket2 so reuse, backlog and source binding
//! are settled before the runtime takes over the socket.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener};
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Tuning for a proxy listen socket.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// SO_REUSEADDR, so a config reload can rebind the same port while
    /// finished connections linger in TIME_WAIT.
    pub reuse_addr: bool,
    /// Pending-connection queue. Logins arrive in bursts when a backend
    /// restarts and every client reconnects at once.
    pub backlog: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            backlog: 1024,
        }
    }
}

/// Bind a configured listen endpoint (`"ip:port"` or `"host:port"`) and
/// hand the socket to the runtime.
pub async fn bind_listener(addr: &str, options: &ListenOptions) -> Result<TcpListener> {
    let target = lookup_host(addr)
        .await
        .map_err(|e| ProxyError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ProxyError::Resolve {
            addr: addr.to_string(),
            reason: "no usable address".to_string(),
        })?;

    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&target.into())?;
    socket.listen(options.backlog as i32)?;

    debug!(addr = %target, backlog = options.backlog, "Listener bound");

    Ok(TcpListener::from_std(socket.into())?)
}

/// Socket for an upstream connection, optionally pinned to a source
/// address so the flow egresses a chosen interface.
pub fn outgoing_socket(target: SocketAddr, source: Option<SocketAddr>) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    // Handshake and status frames are a handful of bytes; Nagle would sit
    // on them.
    socket.set_nodelay(true)?;

    if let Some(source) = source {
        socket.bind(&source.into())?;
        debug!(source = %source, target = %target, "Pinned outgoing source");
    }

    Ok(socket)
}
