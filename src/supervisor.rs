//! Listener group lifecycle
//!
//! Starts one accept loop per configured proxy and restarts the whole group
//! on config reload. Listeners own only their accept loops; forwarding
//! sessions own their sockets and survive a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, ProxyConfig};
use crate::error::Result;
use crate::network::PublicIp;
use crate::panel::PanelCounters;
use crate::proxy::listener::{ListenerContext, ProxyListener};
use crate::registry::Registry;

const STOP_GRACE: Duration = Duration::from_millis(500);

struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: ListenerContext,
    listeners: RwLock<HashMap<String, ListenerHandle>>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        counters: Arc<PanelCounters>,
        oracle: Arc<PublicIp>,
    ) -> Self {
        Self {
            ctx: ListenerContext { registry, counters, oracle },
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn an accept loop for every configured proxy. A bind failure is
    /// reported to the caller; already-started listeners keep running.
    pub async fn start_all(&self, config: &Config) -> Result<()> {
        for (index, proxy) in config.proxies.iter().enumerate() {
            self.start_listener(index, proxy.clone()).await?;
        }
        Ok(())
    }

    async fn start_listener(&self, index: usize, cfg: ProxyConfig) -> Result<()> {
        let listener = ProxyListener::bind(&cfg).await.map_err(|e| {
            error!(proxy = index + 1, listen = %cfg.listen, error = %e, "Failed to listen");
            e
        })?;

        let (stop, stop_rx) = watch::channel(false);
        let listen_addr = cfg.listen.clone();
        let ctx = self.ctx.clone();
        let task = tokio::spawn(ProxyListener::accept_loop(index, cfg, listener, stop_rx, ctx));

        self.listeners
            .write()
            .insert(listen_addr, ListenerHandle { stop, task });
        Ok(())
    }

    /// Signal every accept loop to stop and give them a short grace period.
    pub async fn stop_all(&self) {
        info!("Stopping all proxy servers");

        let handles: Vec<(String, ListenerHandle)> =
            self.listeners.write().drain().collect();

        for (addr, handle) in &handles {
            info!(listen = %addr, "Stopping proxy");
            let _ = handle.stop.send(true);
        }

        tokio::time::sleep(STOP_GRACE).await;

        for (_, handle) in handles {
            handle.task.abort();
        }

        info!("All proxy servers stopped");
    }

    /// Stop every listener, then start fresh ones from the new config.
    pub async fn restart(&self, config: Config) {
        self.stop_all().await;
        info!("Restarting proxy servers with new configuration");
        if let Err(e) = self.start_all(&config).await {
            error!(error = %e, "Failed to restart proxy servers");
        }
    }

    pub fn active_count(&self) -> usize {
        self.listeners.read().len()
    }
}
