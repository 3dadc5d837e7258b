//! Configuration
//!
//! The config file is JSON. Two shapes are accepted: a root object with a
//! `proxies` array plus optional `logging` and `control_panel` sections, or
//! a bare single-proxy object (legacy format, auto-wrapped).

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};

// ============= Helper Defaults =============

fn default_db_path() -> String {
    "logs/mcproxy.db".to_string()
}
fn default_panel_user() -> String {
    "admin".to_string()
}

// ============= Enums =============

/// Whether the status exchange is synthesized locally or round-tripped to
/// the upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    Fake,
    Real,
}

/// Username gate applied at login time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Whitelist,
    Blacklist,
}

// ============= Proxy Config =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen: String,

    #[serde(default)]
    pub description: String,

    pub remote: String,

    /// Local address for outgoing connections (pins an egress interface).
    #[serde(default)]
    pub local_addr: String,

    #[serde(default)]
    pub favicon: String,

    #[serde(default)]
    pub max_player: i32,

    pub ping_mode: PingMode,

    /// Extra delay in milliseconds injected before answering a fake status.
    #[serde(default)]
    pub fake_ping: u64,

    #[serde(default)]
    pub rewrite_host: String,

    #[serde(default)]
    pub rewrite_port: u16,

    pub auth: AuthMode,

    #[serde(default)]
    pub whitelist: HashSet<String>,

    #[serde(default)]
    pub blacklist: HashSet<String>,
}

// ============= Sections =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPanelConfig {
    #[serde(default = "default_panel_user")]
    pub username: String,

    #[serde(default = "default_panel_user")]
    pub password: String,
}

impl Default for ControlPanelConfig {
    fn default() -> Self {
        Self {
            username: default_panel_user(),
            password: default_panel_user(),
        }
    }
}

// ============= Main Config =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub control_panel: ControlPanelConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::Config(format!(
                "read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Multi-proxy shape first; fall back to the legacy single-proxy
        // object when it fails or defines no proxies.
        let multi: std::result::Result<Config, _> = serde_json::from_str(content);
        let config = match multi {
            Ok(config) if !config.proxies.is_empty() => {
                for (i, proxy) in config.proxies.iter().enumerate() {
                    info!(
                        proxy = i + 1,
                        listen = %proxy.listen,
                        remote = %proxy.remote,
                        auth = ?proxy.auth,
                        "Loaded proxy"
                    );
                }
                config
            }
            _ => {
                let legacy: ProxyConfig = serde_json::from_str(content)
                    .map_err(|e| ProxyError::Config(format!("invalid config JSON: {e}")))?;
                info!(
                    listen = %legacy.listen,
                    remote = %legacy.remote,
                    "Loaded legacy single-proxy config"
                );
                Config {
                    proxies: vec![legacy],
                    logging: LogConfig::default(),
                    control_panel: ControlPanelConfig::default(),
                }
            }
        };

        if config.control_panel.username == default_panel_user()
            && config.control_panel.password == default_panel_user()
        {
            warn!("Using default control panel credentials; change them in the config file");
        }
        info!(db_path = %config.logging.db_path, "Log store path");

        Ok(config)
    }

    /// Persist the configuration as indented JSON (4-space, matching the
    /// files the panel historically wrote).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)
            .map_err(|e| ProxyError::Config(format!("serialize config: {e}")))?;
        out.push(b'\n');
        std::fs::write(&path, out)
            .map_err(|e| ProxyError::Config(format!("write {}: {e}", path.as_ref().display())))?;
        Ok(())
    }
}
