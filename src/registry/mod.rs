//! Live connection registry
//!
//! Tracks every forwarding session between login admission and tear-down.
//! Status-only exchanges are never registered. One lock guards the session
//! map and the per-public-IP counters; listings copy out so no I/O happens
//! under the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::panel::PanelCounters;
use crate::protocol::send_disconnect;

/// Maximum number of forwarding sessions allowed per public IP.
pub const MAX_CONNECTIONS_PER_IP: usize = 4;

/// Oracle sentinels that never participate in per-IP accounting.
pub fn is_countable_ip(ip: &str) -> bool {
    !matches!(ip, "" | "N/A" | "Error" | "Unknown")
}

// ============= Session =============

/// An active client connection.
///
/// The client write half is shared between the forward pump and the admin
/// disconnect path; the upstream socket is owned by the pump, which mirrors
/// its current local address here for egress accounting.
pub struct Session {
    pub id: String,
    pub client_addr: String,
    pub proxy_addr: String,
    pub remote_addr: String,
    /// Index in the proxy list, or -1 when created by the balancer.
    pub proxy_index: i32,
    pub public_ip: String,
    pub connected_at: DateTime<Utc>,
    pub started: Instant,

    username: RwLock<String>,
    remote_local: RwLock<Option<SocketAddr>>,
    pub(crate) client_writer: Mutex<OwnedWriteHalf>,
    close_tx: watch::Sender<bool>,
}

/// Serializable snapshot of a session for the control panel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub username: String,
    pub client_addr: String,
    pub proxy_addr: String,
    pub remote_addr: String,
    pub proxy_index: i32,
    pub public_ip: String,
    pub connected_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        client_addr: String,
        proxy_addr: String,
        remote_addr: String,
        proxy_index: i32,
        public_ip: String,
        client_writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            client_addr,
            proxy_addr,
            remote_addr,
            proxy_index,
            public_ip,
            connected_at: Utc::now(),
            started: Instant::now(),
            username: RwLock::new(String::new()),
            remote_local: RwLock::new(None),
            client_writer: Mutex::new(client_writer),
            close_tx,
        })
    }

    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    pub fn set_username(&self, name: &str) {
        *self.username.write() = name.to_string();
    }

    /// Local address of the current upstream socket, updated on every
    /// (re)connect.
    pub fn set_remote_local(&self, addr: Option<SocketAddr>) {
        *self.remote_local.write() = addr;
    }

    pub fn remote_local_ip(&self) -> Option<String> {
        self.remote_local.read().map(|a| a.ip().to_string())
    }

    /// Receiver that flips to `true` when an admin disconnect fires.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn signal_close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            username: self.username(),
            client_addr: self.client_addr.clone(),
            proxy_addr: self.proxy_addr.clone(),
            remote_addr: self.remote_addr.clone(),
            proxy_index: self.proxy_index,
            public_ip: self.public_ip.clone(),
            connected_at: self.connected_at,
            duration_secs: self.started.elapsed().as_secs(),
        }
    }
}

// ============= Registry =============

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    per_ip: HashMap<String, usize>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    online: AtomicI64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        let mut inner = self.inner.write();
        if is_countable_ip(&session.public_ip) {
            let count = inner.per_ip.entry(session.public_ip.clone()).or_insert(0);
            *count += 1;
            info!(ip = %session.public_ip, count = *count, "Connection count for IP");
        }
        inner.sessions.insert(session.id.clone(), session);
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(id)?;
        if is_countable_ip(&session.public_ip) {
            if let Some(count) = inner.per_ip.get_mut(&session.public_ip) {
                if *count > 0 {
                    *count -= 1;
                    info!(ip = %session.public_ip, count = *count, "Connection count for IP");
                }
                if *count == 0 {
                    inner.per_ip.remove(&session.public_ip);
                }
            }
        }
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Snapshot copy of all live sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Stored per-IP counter. Telemetry mirror of [`Registry::count_for_ip`];
    /// admission decisions use the live-socket computation instead.
    pub fn per_ip_count(&self, ip: &str) -> usize {
        self.inner.read().per_ip.get(ip).copied().unwrap_or(0)
    }

    /// Number of outbound flows currently egressing from interface `ip`,
    /// computed from the live upstream sockets.
    pub fn count_for_ip(&self, ip: &str) -> usize {
        if !is_countable_ip(ip) {
            return 0;
        }
        self.list()
            .iter()
            .filter(|s| s.remote_local_ip().as_deref() == Some(ip))
            .count()
    }

    pub fn online(&self) -> i64 {
        self.online.load(Ordering::Relaxed)
    }

    pub fn online_inc(&self) {
        self.online.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement clamped at zero.
    pub fn online_dec(&self) {
        let mut current = self.online.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                break;
            }
            match self.online.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Forcibly disconnect a client: best-effort disconnect frame, short
    /// flush pause, then close both sockets and release every counter.
    pub async fn disconnect(
        &self,
        id: &str,
        reason: &str,
        panel: &PanelCounters,
    ) -> Result<()> {
        let session = self.get(id).ok_or(ProxyError::NotFound)?;

        info!(
            user = %session.username(),
            client = %session.client_addr,
            reason = %reason,
            "Disconnecting client"
        );

        {
            let mut writer = session.client_writer.lock().await;
            let sent = tokio::time::timeout(
                Duration::from_secs(1),
                send_disconnect(&mut *writer, reason),
            )
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(user = %session.username(), error = %e, "Failed to send disconnect message")
                }
                Err(_) => {
                    warn!(user = %session.username(), "Disconnect message write timed out")
                }
            }
        }

        // Give the frame a moment to reach the client before tearing down.
        tokio::time::sleep(Duration::from_millis(200)).await;

        session.signal_close();
        debug!(user = %session.username(), "Closed client and remote connections");

        self.online_dec();
        panel.decrement(&session.proxy_addr);
        self.unregister(id);

        info!(user = %session.username(), "Successfully disconnected client");
        Ok(())
    }
}
