//! Control panel HTTP API
//!
//! JSON endpoints over the registry and supervisor: list sessions, force a
//! disconnect, read counters, reload the configuration. Guarded by HTTP
//! basic auth with the configured credentials. The HTML UI of earlier
//! versions is not part of this build.

pub mod counters;

pub use counters::PanelCounters;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use crate::transport::{bind_listener, ListenOptions};

pub struct ControlPanel {
    pub registry: Arc<Registry>,
    pub counters: Arc<PanelCounters>,
    pub supervisor: Arc<Supervisor>,
    pub config_path: PathBuf,
    pub username: String,
    pub password: String,
}

const DEFAULT_DISCONNECT_REASON: &str = "Disconnected by administrator";

/// Bind and serve the panel API. Bind failure is fatal at process start;
/// the caller decides how to surface it.
pub async fn serve(panel: Arc<ControlPanel>, addr: SocketAddr) -> Result<()> {
    let listener = bind_listener(&addr.to_string(), &ListenOptions::default()).await?;
    info!("Control panel listening on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Panel accept error");
                continue;
            }
        };

        let panel = panel.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let panel = panel.clone();
                async move { handle(req, &panel).await }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), svc)
                .await
            {
                debug!(peer = %peer, error = %e, "Panel connection error");
            }
        });
    }
}

fn authorized<B>(req: &Request<B>, panel: &ControlPanel) -> bool {
    let Some(header) = req.headers().get(hyper::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    credentials == format!("{}:{}", panel.username, panel.password)
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    for pair in query?.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(percent_decode(v));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let (Some(h), Some(l)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((h * 16 + l) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response")
}

async fn handle<B>(
    req: Request<B>,
    panel: &ControlPanel,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if !authorized(&req, panel) {
        let resp = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("www-authenticate", "Basic realm=\"mcproxy\"")
            .body(Full::new(Bytes::from_static(b"unauthorized")))
            .expect("valid response");
        return Ok(resp);
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/api/connections") => {
            let sessions: Vec<_> = panel.registry.list().iter().map(|s| s.info()).collect();
            json_response(StatusCode::OK, json!({ "connections": sessions }))
        }
        (&Method::POST, "/api/disconnect") => {
            let Some(id) = query_param(query.as_deref(), "id") else {
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "missing id" }),
                ));
            };
            let reason = query_param(query.as_deref(), "reason")
                .unwrap_or_else(|| DEFAULT_DISCONNECT_REASON.to_string());

            match panel.registry.disconnect(&id, &reason, &panel.counters).await {
                Ok(()) => json_response(StatusCode::OK, json!({ "status": "disconnected" })),
                Err(ProxyError::NotFound) => {
                    json_response(StatusCode::NOT_FOUND, json!({ "error": "connection not found" }))
                }
                Err(e) => json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": e.to_string() }),
                ),
            }
        }
        (&Method::GET, "/api/stats") => json_response(
            StatusCode::OK,
            json!({
                "online": panel.registry.online(),
                "proxies": panel.counters.snapshot(),
            }),
        ),
        (&Method::POST, "/api/reload") => match Config::load(&panel.config_path) {
            Ok(config) => {
                panel.supervisor.restart(config).await;
                json_response(StatusCode::OK, json!({ "status": "reloaded" }))
            }
            Err(e) => json_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": e.to_string() }),
            ),
        },
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "no such endpoint" })),
    };

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        let q = Some("id=127.0.0.1%3A5000-17&reason=too+loud");
        assert_eq!(
            query_param(q, "id").as_deref(),
            Some("127.0.0.1:5000-17")
        );
        assert_eq!(query_param(q, "reason").as_deref(), Some("too loud"));
        assert_eq!(query_param(q, "missing"), None);
        assert_eq!(query_param(None, "id"), None);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn test_authorized() {
        let panel = ControlPanel {
            registry: Arc::new(Registry::new()),
            counters: Arc::new(PanelCounters::new()),
            supervisor: Arc::new(Supervisor::new(
                Arc::new(Registry::new()),
                Arc::new(PanelCounters::new()),
                Arc::new(crate::network::PublicIp::new()),
            )),
            config_path: PathBuf::from("config.json"),
            username: "admin".to_string(),
            password: "secret".to_string(),
        };

        let ok = Request::builder()
            .header("authorization", format!("Basic {}", BASE64.encode("admin:secret")))
            .body(())
            .unwrap();
        assert!(authorized(&ok, &panel));

        let wrong = Request::builder()
            .header("authorization", format!("Basic {}", BASE64.encode("admin:nope")))
            .body(())
            .unwrap();
        assert!(!authorized(&wrong, &panel));

        let missing = Request::builder().body(()).unwrap();
        assert!(!authorized(&missing, &panel));
    }
}
