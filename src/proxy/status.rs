//! Server-list status and ping exchange
//!
//! After the handshake the client sends Request (0x00) then Ping (0x01).
//! In `fake` mode the response is synthesized from the registry; in `real`
//! mode the exchange is round-tripped to the upstream, falling back to the
//! synthesized answer when the upstream cannot be reached.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::config::{PingMode, ProxyConfig};
use crate::error::Result;
use crate::network::PublicIp;
use crate::protocol::{
    put_long, read_packet, write_packet, Handshake, Packet,
};
use crate::registry::{is_countable_ip, Registry};
use crate::transport::dial;

const PING_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct StatusVersion<'a> {
    name: &'a str,
    protocol: i32,
}

#[derive(Serialize)]
struct StatusPlayerSample {
    name: String,
    id: String,
}

#[derive(Serialize)]
struct StatusPlayers {
    max: i32,
    online: i64,
    sample: Vec<StatusPlayerSample>,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    version: StatusVersion<'a>,
    players: StatusPlayers,
    description: &'a str,
    favicon: &'a str,
}

/// Build the synthesized status document. Every registered session with a
/// known username contributes a player sample.
fn build_status(protocol: i32, cfg: &ProxyConfig, registry: &Registry, description: &str) -> String {
    let sample = registry
        .list()
        .iter()
        .filter_map(|session| {
            let name = session.username();
            if name.is_empty() {
                return None;
            }
            Some(StatusPlayerSample {
                name,
                id: format!("player-{}", session.id),
            })
        })
        .collect();

    serde_json::to_string(&StatusResponse {
        version: StatusVersion { name: "gomcproxy", protocol },
        players: StatusPlayers {
            max: cfg.max_player,
            online: registry.online(),
            sample,
        },
        description,
        favicon: &cfg.favicon,
    })
    .expect("status response serializes")
}

async fn send_status<W: AsyncWrite + Unpin>(
    w: &mut W,
    protocol: i32,
    cfg: &ProxyConfig,
    registry: &Registry,
    description: &str,
) -> Result<()> {
    let json = build_status(protocol, cfg, registry, description);
    let mut payload = Vec::with_capacity(json.len() + 3);
    crate::protocol::put_string(&mut payload, &json);
    write_packet(w, 0x00, &payload).await
}

/// Echo the 8-byte Ping payload back as Pong, byte for byte.
async fn echo_pong<W: AsyncWrite + Unpin>(w: &mut W, ping: &Packet) -> Result<()> {
    let value = ping.scanner().long()?;
    let mut payload = Vec::with_capacity(8);
    put_long(&mut payload, value);
    write_packet(w, 0x01, &payload).await
}

/// Read the client's Ping and answer it locally.
async fn ping_locally<R, W>(r: &mut R, w: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ping = read_packet(r).await?;
    ping.expect_id(0x01)?;
    echo_pong(w, &ping).await
}

/// Handle the status exchange. The handshake frame has already been
/// consumed and announced `next_state == 1`.
pub async fn handle_ping<R, W>(
    reader: &mut R,
    writer: &mut W,
    protocol: i32,
    cfg: &ProxyConfig,
    registry: &Registry,
    oracle: &Arc<PublicIp>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = read_packet(reader).await?;
    request.expect_id(0x00)?;

    match cfg.ping_mode {
        PingMode::Fake => handle_fake(reader, writer, protocol, cfg, registry, oracle).await,
        PingMode::Real => handle_real(reader, writer, protocol, cfg, registry).await,
    }
}

async fn handle_fake<R, W>(
    reader: &mut R,
    writer: &mut W,
    protocol: i32,
    cfg: &ProxyConfig,
    registry: &Registry,
    oracle: &Arc<PublicIp>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut description = cfg.description.clone();
    let public_ip = oracle.public_ip(&cfg.local_addr).await;
    if is_countable_ip(&public_ip) {
        description.push_str(&format!(" (從: {public_ip} 連線)"));
    }

    send_status(writer, protocol, cfg, registry, &description).await?;

    if cfg.fake_ping > 0 {
        tokio::time::sleep(Duration::from_millis(cfg.fake_ping)).await;
    }

    ping_locally(reader, writer).await
}

async fn handle_real<R, W>(
    reader: &mut R,
    writer: &mut W,
    protocol: i32,
    cfg: &ProxyConfig,
    registry: &Registry,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(remote = %cfg.remote, "Pinging remote server");

    // Any failure up to the response forward falls back to the synthesized
    // status; the client still gets a complete exchange.
    let mut remote = match dial(&cfg.remote, &cfg.local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(remote = %cfg.remote, error = %e, "Failed to reach remote for ping");
            send_status(writer, protocol, cfg, registry, &cfg.description).await?;
            return ping_locally(reader, writer).await;
        }
    };

    let upstream_exchange = async {
        let handshake = Handshake {
            protocol,
            address: cfg.rewrite_host.clone(),
            port: cfg.rewrite_port,
            next_state: 1,
        };
        write_packet(&mut remote, 0x00, &handshake.pack()).await?;
        write_packet(&mut remote, 0x00, &[]).await?;

        let response = read_packet(&mut remote).await?;
        response.expect_id(0x00)?;
        Ok::<_, crate::error::ProxyError>(response)
    };

    let response = match upstream_exchange.await {
        Ok(response) => response,
        Err(e) => {
            warn!(remote = %cfg.remote, error = %e, "Upstream status exchange failed");
            send_status(writer, protocol, cfg, registry, &cfg.description).await?;
            return ping_locally(reader, writer).await;
        }
    };

    // Forward the upstream document untouched.
    write_packet(writer, 0x00, &response.payload).await?;

    let ping = read_packet(reader).await?;
    ping.expect_id(0x01)?;

    let sent = tokio::time::timeout(
        PING_EXCHANGE_TIMEOUT,
        write_packet(&mut remote, 0x01, &ping.payload),
    )
    .await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to send ping to remote");
            return echo_pong(writer, &ping).await;
        }
        Err(_) => {
            warn!("Ping to remote timed out");
            return echo_pong(writer, &ping).await;
        }
    }

    let pong = match tokio::time::timeout(PING_EXCHANGE_TIMEOUT, read_packet(&mut remote)).await {
        Ok(Ok(pkt)) if pkt.id == 0x01 => pkt,
        Ok(Ok(pkt)) => {
            warn!(id = pkt.id, "Unexpected packet id from remote");
            return echo_pong(writer, &ping).await;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to read pong from remote");
            return echo_pong(writer, &ping).await;
        }
        Err(_) => {
            warn!("Pong from remote timed out");
            return echo_pong(writer, &ping).await;
        }
    };

    write_packet(writer, 0x01, &pong.payload).await
}
