//! Upstream dialing with SRV resolution
//!
//! A bare hostname (no `:`) is resolved through a `_minecraft._tcp` SRV
//! lookup, falling back to port 25565; anything else is dialed as-is.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::transport::socket::outgoing_socket;

const DEFAULT_PORT: u16 = 25565;
const CONNECT_TIMEOUT_SECS: u64 = 5;

fn srv_resolver() -> Option<&'static TokioAsyncResolver> {
    static RESOLVER: OnceLock<Option<TokioAsyncResolver>> = OnceLock::new();
    RESOLVER
        .get_or_init(|| TokioAsyncResolver::tokio_from_system_conf().ok())
        .as_ref()
}

/// Resolve a configured upstream address to `host:port` form.
///
/// Addresses that already carry a port (or are IPv6 literals) pass through
/// unchanged. A bare hostname is looked up as `_minecraft._tcp.<host>`; the
/// first SRV record wins, any failure falls back to the default port.
pub async fn resolve(address: &str) -> String {
    if address.contains(':') {
        return address.to_string();
    }

    if let Some(resolver) = srv_resolver() {
        match resolver
            .srv_lookup(format!("_minecraft._tcp.{address}."))
            .await
        {
            Ok(lookup) => {
                if let Some(record) = lookup.iter().next() {
                    let target = record.target().to_utf8();
                    let target = target.trim_end_matches('.');
                    debug!(host = %address, target = %target, port = record.port(), "SRV record found");
                    return format!("{}:{}", target, record.port());
                }
            }
            Err(e) => {
                debug!(host = %address, error = %e, "SRV lookup failed, using default port");
            }
        }
    }

    format!("{address}:{DEFAULT_PORT}")
}

/// Resolve and dial the upstream with a 5 s connect timeout. A non-empty
/// `local_addr` must parse as a socket address (port 0 allowed) and is
/// bound as the outgoing source.
pub async fn dial(address: &str, local_addr: &str) -> Result<TcpStream> {
    let resolved = resolve(address).await;

    let bind_addr = if local_addr.is_empty() {
        None
    } else {
        Some(local_addr.parse::<SocketAddr>().map_err(|e| {
            ProxyError::InvalidLocalAddr {
                addr: local_addr.to_string(),
                reason: e.to_string(),
            }
        })?)
    };

    let mut candidates = tokio::net::lookup_host(&resolved)
        .await
        .map_err(|e| ProxyError::Resolve {
            addr: resolved.clone(),
            reason: e.to_string(),
        })?
        .collect::<Vec<_>>();

    // Keep only targets the bound interface can actually reach.
    if let Some(bind) = bind_addr {
        candidates.retain(|a| a.is_ipv4() == bind.is_ipv4());
    }

    let target = candidates.first().copied().ok_or_else(|| ProxyError::Resolve {
        addr: resolved.clone(),
        reason: "no usable address".to_string(),
    })?;

    connect_with_timeout(target, bind_addr).await
}

async fn connect_with_timeout(
    target: SocketAddr,
    bind_addr: Option<SocketAddr>,
) -> Result<TcpStream> {
    let socket = outgoing_socket(target, bind_addr)?;

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(err) => return Err(ProxyError::Io(err)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    match tokio::time::timeout(connect_timeout, stream.writable()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ProxyError::Io(e)),
        Err(_) => {
            return Err(ProxyError::ConnectionTimeout {
                addr: target.to_string(),
            });
        }
    }
    if let Some(e) = stream.take_error()? {
        return Err(ProxyError::Io(e));
    }

    Ok(stream)
}
