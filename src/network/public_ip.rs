//! Public IP discovery per egress interface
//!
//! Asks an HTTP what-is-my-ip endpoint through a socket bound to the given
//! local address and reports the externally visible IP. Sentinels: `"N/A"`
//! for an empty input, `"Error"` when the lookup fails, `"Unknown"` when
//! the service returns an empty body. Results are cached for 60 s.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

const DETECT_URL: &str = "http://ipinfo.io/ip";
const CACHE_TTL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct PublicIp {
    cache: DashMap<String, (String, Instant)>,
}

impl PublicIp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Public address observed when egressing through `local_addr`
    /// (`"ip[:port]"` form; the port is ignored).
    pub async fn public_ip(&self, local_addr: &str) -> String {
        if local_addr.is_empty() {
            return "N/A".to_string();
        }

        if let Some(entry) = self.cache.get(local_addr) {
            let (value, at) = entry.value();
            if at.elapsed() < CACHE_TTL {
                return value.clone();
            }
        }

        let result = self.fetch(local_addr).await;
        self.cache
            .insert(local_addr.to_string(), (result.clone(), Instant::now()));
        result
    }

    /// Pre-populate the cache for a known interface.
    pub fn seed(&self, local_addr: &str, value: &str) {
        self.cache
            .insert(local_addr.to_string(), (value.to_string(), Instant::now()));
    }

    async fn fetch(&self, local_addr: &str) -> String {
        let ip_only = local_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(local_addr);

        let bind_ip: IpAddr = match ip_only.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(local_addr = %local_addr, error = %e, "Invalid interface address for public IP lookup");
                return "Error".to_string();
            }
        };

        let client = match reqwest::Client::builder()
            .local_address(bind_ip)
            .timeout(REQUEST_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Failed to build public IP client");
                return "Error".to_string();
            }
        };

        let body = match client.get(DETECT_URL).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(interface = %ip_only, error = %e, "Failed to read public IP response");
                    return "Error".to_string();
                }
            },
            Err(e) => {
                warn!(interface = %ip_only, error = %e, "Failed to get public IP");
                return "Error".to_string();
            }
        };

        let ip = body.trim();
        if ip.is_empty() {
            return "Unknown".to_string();
        }

        debug!(interface = %ip_only, public_ip = %ip, "Public IP resolved");
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_local_addr_is_na() {
        let oracle = PublicIp::new();
        assert_eq!(oracle.public_ip("").await, "N/A");
    }

    #[tokio::test]
    async fn test_invalid_interface_is_error() {
        let oracle = PublicIp::new();
        assert_eq!(oracle.public_ip("definitely-not-an-ip:0").await, "Error");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_lookup() {
        let oracle = PublicIp::new();
        oracle.seed("10.1.2.3:0", "203.0.113.77");
        assert_eq!(oracle.public_ip("10.1.2.3:0").await, "203.0.113.77");
    }
}
