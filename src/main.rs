//! mcproxy — Minecraft Java Edition reverse proxy

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod error;
mod network;
mod panel;
mod protocol;
mod proxy;
mod registry;
mod supervisor;
mod transport;

use crate::config::Config;
use crate::network::PublicIp;
use crate::panel::{ControlPanel, PanelCounters};
use crate::proxy::Balancer;
use crate::registry::Registry;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let options = cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mcproxy v{} starting up", env!("CARGO_PKG_VERSION"));

    let started = std::time::Instant::now();
    let config = match Config::load(&options.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[mcproxy] {e}");
            std::process::exit(1);
        }
    };
    info!("Configuration loaded in {:?}", started.elapsed());

    let registry = Arc::new(Registry::new());
    let counters = Arc::new(PanelCounters::new());
    let oracle = Arc::new(PublicIp::new());
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        counters.clone(),
        oracle.clone(),
    ));

    // Control panel API
    let control_addr: SocketAddr = match options.control_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!(
                "[mcproxy] invalid control panel address '{}': {e}",
                options.control_addr
            );
            std::process::exit(1);
        }
    };
    let panel = Arc::new(ControlPanel {
        registry: registry.clone(),
        counters: counters.clone(),
        supervisor: supervisor.clone(),
        config_path: PathBuf::from(&options.config_path),
        username: config.control_panel.username.clone(),
        password: config.control_panel.password.clone(),
    });
    info!("Starting control panel on {}", control_addr);
    tokio::spawn(async move {
        if let Err(e) = panel::serve(panel, control_addr).await {
            error!(error = %e, "Control panel failed");
            std::process::exit(1);
        }
    });

    // Optional front-end load balancer
    let _balancer_stop = if let Some(balancer_addr) = options.balancer_addr.clone() {
        info!("Starting load balancer on {}", balancer_addr);
        let balancer = Balancer::new(
            balancer_addr,
            config.proxies.clone(),
            registry.clone(),
            counters.clone(),
            oracle.clone(),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = balancer.run(stop_rx).await {
                error!(error = %e, "Load balancer failed");
                std::process::exit(1);
            }
        });
        Some(stop_tx)
    } else {
        None
    };

    // Per-proxy listeners
    if let Err(e) = supervisor.start_all(&config).await {
        error!(error = %e, "Failed to start proxy servers");
        std::process::exit(1);
    }

    info!("Server is now running. Press Ctrl+C to exit.");
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Signal error: {}", e),
    }

    supervisor.stop_all().await;
    Ok(())
}
