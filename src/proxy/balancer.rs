//! Weighted load balancer
//!
//! A single public listener that reads each client's handshake and hands
//! the connection to the best-scoring proxy configuration. Scoring favors
//! spare capacity and low current load; unhealthy or saturated proxies are
//! heavily penalized, and near-equal candidates are broken at random.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::network::PublicIp;
use crate::panel::PanelCounters;
use crate::proxy::listener::{
    handle_login, read_handshake, ListenerContext, LoginOutcome,
};
use crate::proxy::status;
use crate::registry::{Registry, MAX_CONNECTIONS_PER_IP};
use crate::transport::{bind_listener, ListenOptions};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Health and selection metrics for one proxy.
pub struct ProxyStatistics {
    successful: AtomicI64,
    failed: AtomicI64,
    last_selected: RwLock<Option<DateTime<Utc>>>,
    healthy: AtomicBool,
}

impl ProxyStatistics {
    fn new() -> Self {
        Self {
            successful: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            last_selected: RwLock::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> i64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> i64 {
        self.failed.load(Ordering::Relaxed)
    }
}

struct ProxyScore {
    index: usize,
    connections: usize,
    max_connections: i32,
    weight: f64,
}

pub struct Balancer {
    listen_addr: String,
    proxies: Vec<ProxyConfig>,
    stats: Vec<ProxyStatistics>,
    round_robin: AtomicUsize,
    ctx: ListenerContext,
}

impl Balancer {
    pub fn new(
        listen_addr: String,
        proxies: Vec<ProxyConfig>,
        registry: Arc<Registry>,
        counters: Arc<PanelCounters>,
        oracle: Arc<PublicIp>,
    ) -> Arc<Self> {
        let stats = proxies.iter().map(|_| ProxyStatistics::new()).collect();
        Arc::new(Self {
            listen_addr,
            proxies,
            stats,
            round_robin: AtomicUsize::new(0),
            ctx: ListenerContext { registry, counters, oracle },
        })
    }

    pub fn stats(&self, index: usize) -> &ProxyStatistics {
        &self.stats[index]
    }

    /// Bind and accept until the stop signal fires. Bind failure is fatal
    /// at process start.
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = bind_listener(&self.listen_addr, &ListenOptions::default()).await?;
        info!(listen = %self.listen_addr, "Proxy balancer listening");

        loop {
            if *stop_rx.borrow_and_update() {
                info!(listen = %self.listen_addr, "Stopping proxy balancer");
                return Ok(());
            }

            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    let balancer = self.clone();
                    tokio::spawn(async move {
                        balancer.handle_connection(stream, peer.to_string()).await;
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Balancer failed to accept connection");
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, client_addr: String) {
        info!(client = %client_addr, "Balancer: new connection");

        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);

        let handshake = match read_handshake(&mut reader).await {
            Ok(hs) => hs,
            Err(e) => {
                warn!(client = %client_addr, error = %e, "Balancer: failed to read handshake");
                return;
            }
        };

        let Some((cfg, index)) = self.select_best_proxy().await else {
            error!(client = %client_addr, "Balancer: no suitable proxy found");
            return;
        };

        info!(
            client = %client_addr,
            proxy = index + 1,
            interface = %cfg.local_addr,
            remote = %cfg.remote,
            "Balancer: selected proxy"
        );

        match handshake.next_state {
            1 => {
                debug!(client = %client_addr, "Balancer: handling ping request");
                if let Err(e) = status::handle_ping(
                    &mut reader,
                    &mut wr,
                    handshake.protocol,
                    &cfg,
                    &self.ctx.registry,
                    &self.ctx.oracle,
                )
                .await
                {
                    warn!(client = %client_addr, error = %e, "Balancer: failed to handle ping");
                }
            }
            2 => {
                let outcome = handle_login(
                    reader,
                    wr,
                    client_addr.clone(),
                    &handshake,
                    cfg,
                    -1,
                    Some(self.listen_addr.clone()),
                    &self.ctx,
                )
                .await;

                if let LoginOutcome::Forwarded(result) = outcome {
                    self.record_outcome(index, result.is_ok());
                }
            }
            other => {
                debug!(client = %client_addr, state = other, "Balancer: unknown next state");
            }
        }

        info!(client = %client_addr, "Balancer: connection ended");
    }

    /// Update health statistics after a forwarded session completes.
    fn record_outcome(&self, index: usize, success: bool) {
        let stats = &self.stats[index];
        if success {
            let successful = stats.successful.fetch_add(1, Ordering::Relaxed) + 1;
            if !stats.healthy.load(Ordering::Relaxed)
                && successful > stats.failed.load(Ordering::Relaxed)
            {
                stats.healthy.store(true, Ordering::Relaxed);
                info!(proxy = index + 1, "Proxy marked as healthy again");
            }
        } else {
            let failed = stats.failed.fetch_add(1, Ordering::Relaxed) + 1;
            if failed > stats.successful.load(Ordering::Relaxed) * 2 && failed > 5 {
                stats.healthy.store(false, Ordering::Relaxed);
                warn!(proxy = index + 1, "Proxy marked as unhealthy due to too many failures");
            }
        }
    }

    /// Pick the proxy with the best capacity/load score. Candidates within
    /// 10 % of the best weight are chosen uniformly at random.
    pub async fn select_best_proxy(&self) -> Option<(ProxyConfig, usize)> {
        if self.proxies.is_empty() {
            return None;
        }

        let mut scores = Vec::with_capacity(self.proxies.len());
        let mut total_max: i64 = 0;

        for (index, proxy) in self.proxies.iter().enumerate() {
            let ip = self.ctx.oracle.public_ip(&proxy.local_addr).await;
            let connections = self.ctx.registry.count_for_ip(&ip);

            let max_connections = if proxy.max_player > 0 {
                proxy.max_player
            } else {
                MAX_CONNECTIONS_PER_IP as i32
            };
            total_max += max_connections as i64;

            scores.push(ProxyScore {
                index,
                connections,
                max_connections,
                weight: 0.0,
            });
        }

        for score in &mut scores {
            let capacity_weight =
                score.max_connections as f64 / total_max as f64 * 100.0;
            let load_pct =
                score.connections as f64 / score.max_connections as f64 * 100.0;
            score.weight = capacity_weight * 0.4 + (100.0 - load_pct) * 0.6;

            if !self.stats[score.index].healthy.load(Ordering::Relaxed) {
                score.weight *= 0.1;
            }
            if score.connections >= score.max_connections as usize {
                score.weight *= 0.2;
            }

            debug!(
                proxy = score.index + 1,
                connections = score.connections,
                max = score.max_connections,
                weight = format!("{:.1}", score.weight),
                "Balancer: proxy score"
            );
        }

        let selected = if let Some(best) =
            scores.iter().map(|s| s.weight).max_by(|a, b| a.total_cmp(b))
        {
            let candidates: Vec<&ProxyScore> = scores
                .iter()
                .filter(|s| s.weight >= best * 0.9)
                .collect();

            if candidates.len() > 1 {
                let pick = rand::rng().random_range(0..candidates.len());
                debug!(
                    proxy = candidates[pick].index + 1,
                    candidates = candidates.len(),
                    "Balancer: randomly selected among top candidates"
                );
                candidates[pick].index
            } else {
                candidates[0].index
            }
        } else {
            // No scores at all; rotate through the list.
            self.round_robin.fetch_add(1, Ordering::Relaxed) % self.proxies.len()
        };

        *self.stats[selected].last_selected.write() = Some(Utc::now());

        Some((self.proxies[selected].clone(), selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, PingMode};
    use crate::registry::Session;

    fn proxy(local_addr: &str, max_player: i32) -> ProxyConfig {
        ProxyConfig {
            listen: "0.0.0.0:25566".to_string(),
            description: String::new(),
            remote: "backend".to_string(),
            local_addr: local_addr.to_string(),
            favicon: String::new(),
            max_player,
            ping_mode: PingMode::Fake,
            fake_ping: 0,
            rewrite_host: "backend".to_string(),
            rewrite_port: 25565,
            auth: AuthMode::None,
            whitelist: Default::default(),
            blacklist: Default::default(),
        }
    }

    fn balancer_with(proxies: Vec<ProxyConfig>) -> Arc<Balancer> {
        Balancer::new(
            "0.0.0.0:25565".to_string(),
            proxies,
            Arc::new(Registry::new()),
            Arc::new(PanelCounters::new()),
            Arc::new(PublicIp::new()),
        )
    }

    async fn add_load(balancer: &Balancer, egress_ip: &str, count: usize) -> Vec<TcpStream> {
        let mut peers = Vec::new();
        for i in 0..count {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let peer = TcpStream::connect(listener.local_addr().unwrap())
                .await
                .unwrap();
            let (server, _) = listener.accept().await.unwrap();
            let (_rd, wr) = server.into_split();
            let session = Session::new(
                format!("{egress_ip}-{i}"),
                format!("127.0.0.1:{}", 41000 + i),
                "0.0.0.0:25565".to_string(),
                "backend".to_string(),
                -1,
                egress_ip.to_string(),
                wr,
            );
            session.set_remote_local(Some(format!("{egress_ip}:39000").parse().unwrap()));
            balancer.ctx.registry.register(session);
            peers.push(peer);
        }
        peers
    }

    #[tokio::test]
    async fn test_empty_proxy_list_selects_nothing() {
        let balancer = balancer_with(vec![]);
        assert!(balancer.select_best_proxy().await.is_none());
    }

    #[tokio::test]
    async fn test_higher_capacity_wins_when_idle() {
        let balancer = balancer_with(vec![
            proxy("10.0.0.1:0", 100),
            proxy("10.0.0.2:0", 5),
        ]);
        balancer.ctx.oracle.seed("10.0.0.1:0", "203.0.113.1");
        balancer.ctx.oracle.seed("10.0.0.2:0", "203.0.113.2");

        for _ in 0..10 {
            let (_, index) = balancer.select_best_proxy().await.unwrap();
            assert_eq!(index, 0);
        }
        assert!(balancer.stats(0).last_selected.read().is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_proxy_never_selected_over_healthy() {
        let balancer = balancer_with(vec![
            proxy("10.0.0.1:0", 50),
            proxy("10.0.0.2:0", 50),
        ]);
        balancer.ctx.oracle.seed("10.0.0.1:0", "203.0.113.1");
        balancer.ctx.oracle.seed("10.0.0.2:0", "203.0.113.2");
        balancer.stats[1].healthy.store(false, Ordering::Relaxed);

        for _ in 0..20 {
            let (_, index) = balancer.select_best_proxy().await.unwrap();
            assert_eq!(index, 0);
        }
    }

    #[tokio::test]
    async fn test_saturated_proxy_penalized() {
        let balancer = balancer_with(vec![
            proxy("10.0.0.1:0", 2),
            proxy("10.0.0.2:0", 2),
        ]);
        balancer.ctx.oracle.seed("10.0.0.1:0", "203.0.113.1");
        balancer.ctx.oracle.seed("10.0.0.2:0", "203.0.113.2");
        // proxy 0 is at capacity
        let _peers = add_load(&balancer, "203.0.113.1", 2).await;

        for _ in 0..20 {
            let (_, index) = balancer.select_best_proxy().await.unwrap();
            assert_eq!(index, 1);
        }
    }

    #[tokio::test]
    async fn test_equal_candidates_both_get_selected() {
        let balancer = balancer_with(vec![
            proxy("10.0.0.1:0", 50),
            proxy("10.0.0.2:0", 50),
        ]);
        balancer.ctx.oracle.seed("10.0.0.1:0", "203.0.113.1");
        balancer.ctx.oracle.seed("10.0.0.2:0", "203.0.113.2");

        let mut seen = [false, false];
        for _ in 0..64 {
            let (_, index) = balancer.select_best_proxy().await.unwrap();
            seen[index] = true;
        }
        assert!(seen[0] && seen[1], "tie-breaking never chose one side");
    }

    #[test]
    fn test_health_transitions() {
        let balancer = balancer_with(vec![proxy("10.0.0.1:0", 10)]);

        // six failures against zero successes trips the threshold
        for _ in 0..6 {
            balancer.record_outcome(0, false);
        }
        assert!(!balancer.stats(0).is_healthy());

        // recovery: more successes than failures
        for _ in 0..7 {
            balancer.record_outcome(0, true);
        }
        assert!(balancer.stats(0).is_healthy());
        assert_eq!(balancer.stats(0).successful(), 7);
        assert_eq!(balancer.stats(0).failed(), 6);
    }
}
