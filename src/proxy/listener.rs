//! Per-proxy accept loop and connection dispatch
//!
//! Each configured proxy owns one TCP listener. The accept loop polls with
//! a 100 ms deadline so a stop signal is noticed promptly; an accept
//! timeout just continues, any other accept error ends the loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::network::PublicIp;
use crate::panel::PanelCounters;
use crate::protocol::{read_packet, send_disconnect, Handshake};
use crate::proxy::forward::{handle_forward, VERSION_1_8_9};
use crate::proxy::status;
use crate::registry::{Registry, Session, MAX_CONNECTIONS_PER_IP};
use crate::transport::{bind_listener, ListenOptions};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared handles every connection handler needs.
#[derive(Clone)]
pub struct ListenerContext {
    pub registry: Arc<Registry>,
    pub counters: Arc<PanelCounters>,
    pub oracle: Arc<PublicIp>,
}

pub struct ProxyListener;

impl ProxyListener {
    /// Bind the listen socket. Separate from the accept loop so a bind
    /// failure can be fatal at startup.
    pub async fn bind(cfg: &ProxyConfig) -> Result<TcpListener> {
        bind_listener(&cfg.listen, &ListenOptions::default()).await
    }

    /// Accept until the stop signal fires.
    pub async fn accept_loop(
        index: usize,
        cfg: ProxyConfig,
        listener: TcpListener,
        mut stop_rx: watch::Receiver<bool>,
        ctx: ListenerContext,
    ) {
        info!(proxy = index + 1, listen = %cfg.listen, "Server listening");

        loop {
            if *stop_rx.borrow_and_update() {
                info!(proxy = index + 1, listen = %cfg.listen, "Stopping server");
                break;
            }

            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    let cfg = cfg.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer.to_string(), index, cfg, ctx).await;
                    });
                }
                Ok(Err(e)) => {
                    error!(proxy = index + 1, error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: String,
    index: usize,
    cfg: ProxyConfig,
    ctx: ListenerContext,
) {
    info!(proxy = index + 1, client = %client_addr, "New connection");

    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let handshake = match read_handshake(&mut reader).await {
        Ok(hs) => hs,
        Err(e) => {
            warn!(proxy = index + 1, client = %client_addr, error = %e, "Failed to read handshake");
            return;
        }
    };

    info!(
        proxy = index + 1,
        client = %client_addr,
        address = %handshake.address.escape_default(),
        port = handshake.port,
        protocol = handshake.protocol,
        state = handshake.next_state,
        "Client handshake"
    );

    match handshake.next_state {
        1 => {
            debug!(proxy = index + 1, client = %client_addr, "Handling ping request");
            if let Err(e) = status::handle_ping(
                &mut reader,
                &mut wr,
                handshake.protocol,
                &cfg,
                &ctx.registry,
                &ctx.oracle,
            )
            .await
            {
                warn!(proxy = index + 1, client = %client_addr, error = %e, "Failed to handle ping");
            }
        }
        2 => {
            handle_login(
                reader,
                wr,
                client_addr.clone(),
                &handshake,
                cfg,
                index as i32,
                None,
                &ctx,
            )
            .await;
        }
        other => {
            debug!(proxy = index + 1, client = %client_addr, state = other, "Unknown next state");
        }
    }

    info!(proxy = index + 1, client = %client_addr, "Connection ended");
}

pub(crate) async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake> {
    let packet = read_packet(reader).await?;
    Handshake::scan(&packet)
}

/// Outcome of a login-intent connection, used by the balancer for health
/// accounting.
pub(crate) enum LoginOutcome {
    /// Admission failed; the client got a disconnect frame.
    Rejected,
    /// The forward handler ran to completion with this result.
    Forwarded(Result<()>),
}

/// Run the login admission checks and, when they pass, the forward handler.
///
/// `extra_counter` is an additional panel counter key held for the lifetime
/// of the forward (the balancer passes its own listen address).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn handle_login<R>(
    reader: R,
    mut wr: OwnedWriteHalf,
    client_addr: String,
    handshake: &Handshake,
    cfg: ProxyConfig,
    proxy_index: i32,
    extra_counter: Option<String>,
    ctx: &ListenerContext,
) -> LoginOutcome
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if handshake.protocol < VERSION_1_8_9 {
        warn!(client = %client_addr, protocol = handshake.protocol, "Unsupported protocol version");
        reject(&mut wr, &client_addr, "unsupported client version").await;
        return LoginOutcome::Rejected;
    }

    if ctx.registry.online() >= cfg.max_player as i64 {
        warn!(client = %client_addr, "Server full, rejecting client");
        reject(&mut wr, &client_addr, "The server is full").await;
        return LoginOutcome::Rejected;
    }

    let public_ip = ctx.oracle.public_ip(&cfg.local_addr).await;

    let current = ctx.registry.count_for_ip(&public_ip);
    if current >= MAX_CONNECTIONS_PER_IP {
        warn!(
            client = %client_addr,
            ip = %public_ip,
            connections = current,
            "Connection limit reached for IP"
        );
        reject(&mut wr, &client_addr, "Connection limit reached for your IP").await;
        return LoginOutcome::Rejected;
    }

    let unix_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let session_id = format!("{client_addr}-{unix_nanos}");

    let session = Session::new(
        session_id.clone(),
        client_addr.clone(),
        cfg.listen.clone(),
        cfg.remote.clone(),
        proxy_index,
        public_ip,
        wr,
    );
    ctx.registry.register(session.clone());

    if handshake.is_fml() {
        info!(client = %client_addr, "FML client detected");
    }

    if let Some(key) = &extra_counter {
        ctx.counters.increment(key);
    }

    let result = handle_forward(
        reader,
        session,
        handshake.protocol,
        handshake.is_fml(),
        cfg,
        ctx.registry.clone(),
        ctx.counters.clone(),
    )
    .await;

    if let Some(key) = &extra_counter {
        ctx.counters.decrement(key);
    }

    if let Err(e) = &result {
        warn!(client = %client_addr, error = %e, "Failed to handle forward");
    }

    ctx.registry.unregister(&session_id);
    LoginOutcome::Forwarded(result)
}

async fn reject(wr: &mut OwnedWriteHalf, client_addr: &str, reason: &str) {
    if let Err(e) = send_disconnect(wr, reason).await {
        warn!(client = %client_addr, error = %e, "Failed to send disconnect");
    }
}
