//! Login forwarding
//!
//! Runs the login handshake rewrite against the upstream, then pumps bytes
//! in both directions until either side finishes. Transient upstream
//! failures are answered with a re-dial (re-resolving DNS); the client side
//! is never retried.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{AuthMode, ProxyConfig};
use crate::error::Result;
use crate::panel::PanelCounters;
use crate::protocol::{
    put_string, read_packet, send_disconnect, write_packet, Handshake, FML_MARKER,
};
use crate::registry::{Registry, Session};
use crate::transport::dial;

/// Minimum supported protocol version (1.8.9).
pub const VERSION_1_8_9: i32 = 47;

const FORWARD_BUFFER_SIZE: usize = 64 * 1024;

/// Username gate. Returns the rejection reason, or `None` to admit.
fn allow_join(username: &str, cfg: &ProxyConfig) -> Option<&'static str> {
    match cfg.auth {
        AuthMode::None => None,
        AuthMode::Whitelist => {
            if cfg.whitelist.contains(username) {
                None
            } else {
                Some("You are not whitelisted on this server")
            }
        }
        AuthMode::Blacklist => {
            if cfg.blacklist.contains(username) {
                Some("You are banned from this server")
            } else {
                None
            }
        }
    }
}

fn upstream_handshake(protocol: i32, cfg: &ProxyConfig, fml: bool) -> Vec<u8> {
    let mut address = cfg.rewrite_host.clone();
    if fml {
        address.push_str(FML_MARKER);
    }
    Handshake {
        protocol,
        address,
        port: cfg.rewrite_port,
        next_state: 2,
    }
    .pack()
}

fn login_start_payload(username: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + 2);
    put_string(&mut payload, username);
    payload
}

/// Handle a login-intent connection. The handshake frame has been consumed,
/// admission checks have passed and the session is registered; the caller
/// unregisters it when this returns.
pub async fn handle_forward<R>(
    reader: R,
    session: Arc<Session>,
    protocol: i32,
    fml: bool,
    cfg: ProxyConfig,
    registry: Arc<Registry>,
    counters: Arc<PanelCounters>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    registry.online_inc();
    counters.increment(&cfg.listen);

    let result = run_forward(reader, session, protocol, fml, &cfg, &registry).await;

    registry.online_dec();
    counters.decrement(&cfg.listen);

    result
}

async fn run_forward<R>(
    mut reader: R,
    session: Arc<Session>,
    protocol: i32,
    fml: bool,
    cfg: &ProxyConfig,
    registry: &Arc<Registry>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Login Start; the payload layout varies between protocol versions, so
    // it is relayed verbatim and only the username is scanned out.
    let login_start = read_packet(&mut reader).await?;
    login_start.expect_id(0x00)?;
    let username = login_start.scanner().string()?;

    info!(user = %username, "User login attempt");

    // A live session from the same client address that already carries this
    // username means BungeeCord is reusing the TCP connection to switch
    // backends; replaying the outer handshake would confuse the downstream.
    let is_switch = registry.list().iter().any(|s| {
        s.id != session.id
            && s.client_addr == session.client_addr
            && !s.username().is_empty()
            && s.username() == username
    });
    if is_switch {
        debug!(user = %username, "Detected BungeeCord server switch");
    }

    session.set_username(&username);

    if let Some(reason) = allow_join(&username, cfg) {
        warn!(user = %username, reason = %reason, "User rejected");
        let mut writer = session.client_writer.lock().await;
        send_disconnect(&mut *writer, reason).await?;
        return Ok(());
    }

    info!(user = %username, "User authenticated");

    debug!(remote = %cfg.remote, local_addr = %cfg.local_addr, "Connecting to remote server");
    let remote = dial(&cfg.remote, &cfg.local_addr).await?;
    session.set_remote_local(remote.local_addr().ok());

    let (up_rd, mut up_wr) = remote.into_split();

    if is_switch {
        // Bungee already holds the session on the backend side; nothing to
        // replay here.
        info!(user = %username, "Handling server switch, skipping handshake replay");
    } else {
        write_packet(&mut up_wr, 0x00, &upstream_handshake(protocol, cfg, fml)).await?;
        write_packet(&mut up_wr, 0x00, &login_start.payload).await?;
    }

    info!(user = %username, "Starting data forwarding");

    let s2c = tokio::spawn(upstream_to_client(
        up_rd,
        session.clone(),
        cfg.clone(),
        username.clone(),
        protocol,
        fml,
        is_switch,
    ));
    let c2s = tokio::spawn(client_to_upstream(
        reader,
        up_wr,
        session.clone(),
        cfg.clone(),
        username.clone(),
    ));

    let (a, b) = tokio::join!(s2c, c2s);
    if let Err(e) = a {
        warn!(error = %e, "Upstream-to-client task panicked");
    }
    if let Err(e) = b {
        warn!(error = %e, "Client-to-upstream task panicked");
    }

    info!(user = %username, "Data forwarding completed");
    Ok(())
}

async fn reconnect(
    session: &Arc<Session>,
    cfg: &ProxyConfig,
    username: &str,
) -> Option<TcpStream> {
    match dial(&cfg.remote, &cfg.local_addr).await {
        Ok(stream) => {
            info!(user = %username, remote = %cfg.remote, "Reconnected to remote server");
            session.set_remote_local(stream.local_addr().ok());
            Some(stream)
        }
        Err(e) => {
            warn!(user = %username, remote = %cfg.remote, error = %e, "Failed to reconnect to remote server");
            None
        }
    }
}

async fn upstream_to_client(
    up_rd: OwnedReadHalf,
    session: Arc<Session>,
    cfg: ProxyConfig,
    username: String,
    protocol: i32,
    fml: bool,
    is_switch: bool,
) {
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
    let mut total: u64 = 0;
    let mut close_rx = session.close_signal();

    enum Reader {
        Half(OwnedReadHalf),
        Whole(OwnedReadHalf, OwnedWriteHalf),
    }
    impl Reader {
        fn half(&mut self) -> &mut OwnedReadHalf {
            match self {
                Reader::Half(r) => r,
                Reader::Whole(r, _) => r,
            }
        }
    }

    let mut upstream = Reader::Half(up_rd);

    loop {
        let read = tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
            read = upstream.half().read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(user = %username, total_bytes = total, "Server closed connection");
                let mut writer = session.client_writer.lock().await;
                let _ = writer.shutdown().await;
                break;
            }
            Ok(n) => {
                total += n as u64;
                let mut writer = session.client_writer.lock().await;
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(user = %username, error = %e, "Failed to write to client");
                    break;
                }
            }
            Err(e) => {
                warn!(user = %username, error = %e, "Read error from server, attempting to reconnect");
                let Some(stream) = reconnect(&session, &cfg, &username).await else {
                    break;
                };
                let (new_rd, mut new_wr) = stream.into_split();

                if !is_switch {
                    // A fresh socket needs the handshake and login replayed
                    // before the backend will talk to us again.
                    let replay = async {
                        write_packet(&mut new_wr, 0x00, &upstream_handshake(protocol, &cfg, fml))
                            .await?;
                        write_packet(&mut new_wr, 0x00, &login_start_payload(&username)).await
                    };
                    if let Err(e) = replay.await {
                        warn!(user = %username, error = %e, "Failed to replay login on reconnect");
                        break;
                    }
                }

                // The write half stays alive so the socket does not
                // half-close underneath us.
                upstream = Reader::Whole(new_rd, new_wr);
            }
        }
    }

    debug!(user = %username, total_bytes = total, "Forwarded server-to-client");
}

async fn client_to_upstream<R>(
    mut reader: R,
    up_wr: OwnedWriteHalf,
    session: Arc<Session>,
    cfg: ProxyConfig,
    username: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
    let mut total: u64 = 0;
    let mut close_rx = session.close_signal();

    enum Writer {
        Half(OwnedWriteHalf),
        Whole(OwnedReadHalf, OwnedWriteHalf),
    }
    impl Writer {
        fn half(&mut self) -> &mut OwnedWriteHalf {
            match self {
                Writer::Half(w) => w,
                Writer::Whole(_, w) => w,
            }
        }
    }

    let mut upstream = Writer::Half(up_wr);

    loop {
        let read = tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(user = %username, total_bytes = total, "Client closed connection");
                let _ = upstream.half().shutdown().await;
                break;
            }
            Ok(n) => {
                total += n as u64;
                if let Err(e) = upstream.half().write_all(&buf[..n]).await {
                    warn!(user = %username, error = %e, "Write error to server, attempting to reconnect");
                    let Some(stream) = reconnect(&session, &cfg, &username).await else {
                        break;
                    };
                    let (new_rd, new_wr) = stream.into_split();
                    upstream = Writer::Whole(new_rd, new_wr);

                    // Retry the write once on the new socket.
                    if let Err(e) = upstream.half().write_all(&buf[..n]).await {
                        warn!(user = %username, error = %e, "Retry write to server failed");
                        break;
                    }
                }
            }
            Err(e) => {
                debug!(user = %username, error = %e, "Client read error");
                break;
            }
        }
    }

    debug!(user = %username, total_bytes = total, "Forwarded client-to-server");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PingMode;
    use tokio::net::{TcpListener, TcpStream};

    fn test_cfg(remote: &str, auth: AuthMode) -> ProxyConfig {
        ProxyConfig {
            listen: "0.0.0.0:25565".to_string(),
            description: String::new(),
            remote: remote.to_string(),
            local_addr: String::new(),
            favicon: String::new(),
            max_player: 20,
            ping_mode: PingMode::Fake,
            fake_ping: 0,
            rewrite_host: "backend.internal".to_string(),
            rewrite_port: 25566,
            auth,
            whitelist: Default::default(),
            blacklist: Default::default(),
        }
    }

    async fn client_session() -> (Arc<Session>, TcpStream, OwnedReadHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (rd, wr) = server.into_split();
        let session = Session::new(
            format!("{peer}-1"),
            peer.to_string(),
            "0.0.0.0:25565".to_string(),
            "backend".to_string(),
            0,
            "203.0.113.1".to_string(),
            wr,
        );
        (session, client, rd)
    }

    fn login_start_frame(username: &str) -> Vec<u8> {
        let payload = login_start_payload(username);
        let mut frame = Vec::new();
        frame.push((1 + payload.len()) as u8);
        frame.push(0x00);
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn test_allow_join_modes() {
        let mut cfg = test_cfg("backend", AuthMode::None);
        assert_eq!(allow_join("steve", &cfg), None);

        cfg.auth = AuthMode::Whitelist;
        cfg.whitelist.insert("steve".to_string());
        assert_eq!(allow_join("steve", &cfg), None);
        assert!(allow_join("alex", &cfg).is_some());

        cfg.auth = AuthMode::Blacklist;
        cfg.blacklist.insert("griefer".to_string());
        assert!(allow_join("griefer", &cfg).is_some());
        assert_eq!(allow_join("steve", &cfg), None);
    }

    #[test]
    fn test_upstream_handshake_fml_suffix() {
        let cfg = test_cfg("backend", AuthMode::None);
        let plain = upstream_handshake(47, &cfg, false);
        let modded = upstream_handshake(47, &cfg, true);

        let hs = Handshake::scan(&crate::protocol::Packet { id: 0, payload: plain }).unwrap();
        assert_eq!(hs.address, "backend.internal");
        assert_eq!(hs.next_state, 2);

        let hs = Handshake::scan(&crate::protocol::Packet { id: 0, payload: modded }).unwrap();
        assert!(hs.address.ends_with(FML_MARKER));
        assert!(hs.address.starts_with("backend.internal"));
    }

    #[tokio::test]
    async fn test_forward_relays_login_and_bytes() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();

            let handshake = read_packet(&mut stream).await.unwrap();
            let hs = Handshake::scan(&handshake).unwrap();
            assert_eq!(hs.address, "backend.internal");
            assert_eq!(hs.port, 25566);
            assert_eq!(hs.next_state, 2);

            let login = read_packet(&mut stream).await.unwrap();
            assert_eq!(login.id, 0x00);
            assert_eq!(login.scanner().string().unwrap(), "steve");

            // echo a greeting downstream, then mirror what the client sends
            stream.write_all(b"welcome").await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            // closing cleanly ends the pump
        });

        let (session, mut client, client_rd) = client_session().await;
        let registry = Arc::new(Registry::new());
        let counters = Arc::new(PanelCounters::new());
        registry.register(session.clone());

        let cfg = test_cfg(&upstream_addr, AuthMode::None);
        let forward = tokio::spawn(handle_forward(
            client_rd,
            session.clone(),
            47,
            false,
            cfg.clone(),
            registry.clone(),
            counters.clone(),
        ));

        client.write_all(&login_start_frame("steve")).await.unwrap();

        let mut greeting = [0u8; 7];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"welcome");

        client.write_all(b"hello").await.unwrap();
        upstream_task.await.unwrap();

        // upstream closed; the pump shuts the client socket down
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        drop(client);

        forward.await.unwrap().unwrap();
        assert_eq!(registry.online(), 0);
        assert_eq!(counters.get("0.0.0.0:25565"), 0);
        assert_eq!(session.username(), "steve");
    }

    #[tokio::test]
    async fn test_whitelist_reject_sends_disconnect() {
        let (session, mut client, client_rd) = client_session().await;
        let registry = Arc::new(Registry::new());
        let counters = Arc::new(PanelCounters::new());
        registry.register(session.clone());

        let mut cfg = test_cfg("127.0.0.1:1", AuthMode::Whitelist);
        cfg.whitelist.insert("steve".to_string());

        let forward = tokio::spawn(handle_forward(
            client_rd,
            session.clone(),
            47,
            false,
            cfg.clone(),
            registry.clone(),
            counters.clone(),
        ));

        client.write_all(&login_start_frame("alex")).await.unwrap();

        forward.await.unwrap().unwrap();

        let pkt = read_packet(&mut client).await.unwrap();
        assert_eq!(pkt.id, 0x1a);
        let json = pkt.scanner().string().unwrap();
        assert!(json.contains("whitelisted"));

        assert_eq!(registry.online(), 0);
        assert_eq!(counters.get("0.0.0.0:25565"), 0);
    }

    #[tokio::test]
    async fn test_fml_marker_reaches_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let handshake = read_packet(&mut stream).await.unwrap();
            let hs = Handshake::scan(&handshake).unwrap();
            assert!(hs.address.ends_with(FML_MARKER));
            let _ = read_packet(&mut stream).await.unwrap();
        });

        let (session, mut client, client_rd) = client_session().await;
        let registry = Arc::new(Registry::new());
        let counters = Arc::new(PanelCounters::new());
        registry.register(session.clone());

        let cfg = test_cfg(&upstream_addr, AuthMode::None);
        let forward = tokio::spawn(handle_forward(
            client_rd,
            session.clone(),
            47,
            true,
            cfg.clone(),
            registry.clone(),
            counters.clone(),
        ));

        client.write_all(&login_start_frame("forge_user")).await.unwrap();
        upstream_task.await.unwrap();

        drop(client);
        forward.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_switch_skips_handshake_replay() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            // No handshake or login replay on the switch branch; the first
            // bytes are raw relayed traffic.
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        });

        let (session, mut client, client_rd) = client_session().await;

        // A prior session from the same client address already carries the
        // username, which marks this login as a Bungee backend switch.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _prior_peer = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (prior_server, _) = listener.accept().await.unwrap();
        let (_prior_rd, prior_wr) = prior_server.into_split();
        let prior = Session::new(
            "prior-0".to_string(),
            session.client_addr.clone(),
            "0.0.0.0:25565".to_string(),
            "backend".to_string(),
            0,
            "203.0.113.1".to_string(),
            prior_wr,
        );
        prior.set_username("steve");

        let registry = Arc::new(Registry::new());
        let counters = Arc::new(PanelCounters::new());
        registry.register(prior);
        registry.register(session.clone());

        let cfg = test_cfg(&upstream_addr, AuthMode::None);
        let forward = tokio::spawn(handle_forward(
            client_rd,
            session.clone(),
            47,
            false,
            cfg.clone(),
            registry.clone(),
            counters.clone(),
        ));

        client.write_all(&login_start_frame("steve")).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        upstream_task.await.unwrap();
        drop(client);
        forward.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bulk_transfer_both_directions() {
        const CHUNK: usize = 1024;
        const TOTAL: usize = 1024 * 1024;

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let (mut rd, mut wr) = stream.into_split();
            let _ = read_packet(&mut rd).await.unwrap();
            let _ = read_packet(&mut rd).await.unwrap();

            let writer = tokio::spawn(async move {
                let block = [0xabu8; CHUNK];
                for _ in 0..TOTAL / CHUNK {
                    wr.write_all(&block).await.unwrap();
                }
                wr.shutdown().await.unwrap();
            });

            let mut received = 0usize;
            let mut buf = [0u8; 8192];
            loop {
                let n = rd.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                assert!(buf[..n].iter().all(|b| *b == 0xcd));
                received += n;
            }
            writer.await.unwrap();
            received
        });

        let (session, client, client_rd) = client_session().await;
        let registry = Arc::new(Registry::new());
        let counters = Arc::new(PanelCounters::new());
        registry.register(session.clone());

        let cfg = test_cfg(&upstream_addr, AuthMode::None);
        let forward = tokio::spawn(handle_forward(
            client_rd,
            session.clone(),
            47,
            false,
            cfg.clone(),
            registry.clone(),
            counters.clone(),
        ));

        let (mut client_rd_half, mut client_wr_half) = client.into_split();
        client_wr_half
            .write_all(&login_start_frame("bulk"))
            .await
            .unwrap();

        let client_writer = tokio::spawn(async move {
            let block = [0xcdu8; CHUNK];
            for _ in 0..TOTAL / CHUNK {
                client_wr_half.write_all(&block).await.unwrap();
            }
            client_wr_half.shutdown().await.unwrap();
        });

        let mut received = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            let n = client_rd_half.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|b| *b == 0xab));
            received += n;
        }

        assert_eq!(received, TOTAL);
        assert_eq!(upstream_task.await.unwrap(), TOTAL);
        client_writer.await.unwrap();
        forward.await.unwrap().unwrap();

        assert_eq!(registry.online(), 0);
    }
}
