//! Local `/setup` namespace: health, status, restart and reset endpoints
//!
//! Served by the proxy itself, before any gateway gating. Everything except
//! the health check sits behind HTTP Basic auth against `SETUP_PASSWORD`.

use crate::error::start_error_response;
use crate::pool::{full, PoolStats, ProxyBody};
use crate::supervisor::Supervisor;
use crate::token::TokenSource;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Method, Request, Response, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SETUP_PREFIX: &str = "/setup";

const REALM: &str = "Basic realm=\"Wakegate Setup\"";

/// Whether `path` belongs to the setup namespace
pub fn is_setup_path(path: &str) -> bool {
    path == SETUP_PREFIX
        || path
            .strip_prefix(SETUP_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn response(status: StatusCode, body: impl Into<hyper::body::Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full(value.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn unauthorized() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, REALM)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full("Auth required"))
        .expect("valid response with StatusCode enum and static headers")
}

/// Extract the password from an `Authorization: Basic` header. The user name is ignored.
fn basic_auth_password<B>(req: &Request<B>) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_, password) = credentials.split_once(':')?;
    Some(password.to_string())
}

pub struct SetupRoutes {
    supervisor: Arc<Supervisor>,
    password: Option<String>,
    config_path: PathBuf,
    token_source: TokenSource,
    pool_stats: Option<Arc<PoolStats>>,
}

impl SetupRoutes {
    pub fn new(
        supervisor: Arc<Supervisor>,
        password: Option<String>,
        config_path: PathBuf,
        token_source: TokenSource,
    ) -> Self {
        Self {
            supervisor,
            password: password.filter(|p| !p.trim().is_empty()),
            config_path,
            token_source,
            pool_stats: None,
        }
    }

    /// Report forwarding counters of the proxy's connection pool in the status
    pub fn attach_pool_stats(&mut self, stats: Arc<PoolStats>) {
        self.pool_stats = Some(stats);
    }

    pub fn password_set(&self) -> bool {
        self.password.is_some()
    }

    pub async fn handle<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().trim_end_matches('/');
        let path = if path.is_empty() { SETUP_PREFIX } else { path };

        debug!(%method, path, "Setup request");

        if method == Method::GET && path == "/setup/healthz" {
            return json_response(StatusCode::OK, serde_json::json!({ "ok": true }));
        }

        let Some(ref expected) = self.password else {
            return response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "SETUP_PASSWORD is not set. Set it in the environment to use /setup.",
            );
        };
        if basic_auth_password(req).as_deref() != Some(expected.as_str()) {
            warn!(path, "Unauthorized setup request");
            return unauthorized();
        }

        match (&method, path) {
            (&Method::GET, "/setup") => response(StatusCode::OK, self.status_page()),
            (&Method::GET, "/setup/api/status") => {
                json_response(StatusCode::OK, self.status_json())
            }
            (&Method::POST, "/setup/api/restart") => self.restart().await,
            (&Method::POST, "/setup/api/reset") => self.reset(),
            _ => response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn status_json(&self) -> serde_json::Value {
        let forwarded = self.pool_stats.as_ref().map(|stats| {
            serde_json::json!({
                "requests": stats.get_total_requests(),
                "failed": stats.get_failed_requests(),
            })
        });
        serde_json::json!({
            "configured": self.supervisor.is_configured(),
            "gatewayTarget": self.supervisor.target().to_string(),
            "gateway": self.supervisor.status(),
            "tokenSource": self.token_source,
            "forwarded": forwarded,
        })
    }

    fn status_page(&self) -> String {
        let status = self.supervisor.status();
        let configured = if self.supervisor.is_configured() {
            "yes"
        } else {
            "no (POST /setup/api/restart after writing the gateway config)"
        };
        let pid = status
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        format!(
            "Wakegate setup\n\nconfigured:  {}\nconfig file: {}\ngateway:     {:?} at {}\npid:         {}\nspawns:      {}\nrestarts:    {}\n",
            configured,
            self.config_path.display(),
            status.state,
            status.target,
            pid,
            status.spawns,
            status.restarts,
        )
    }

    async fn restart(&self) -> Response<ProxyBody> {
        info!("Gateway restart requested via setup");
        match self.supervisor.restart().await {
            Ok(_) => json_response(
                StatusCode::OK,
                serde_json::json!({ "ok": true, "gateway": self.supervisor.status() }),
            ),
            Err(e) => {
                error!(error = %e, "Gateway restart failed");
                start_error_response(&e)
            }
        }
    }

    fn reset(&self) -> Response<ProxyBody> {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => {
                info!(path = %self.config_path.display(), "Deleted gateway config");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(path = %self.config_path.display(), error = %e, "Failed to delete gateway config");
                return response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to delete config file: {}", e),
                );
            }
        }
        response(
            StatusCode::OK,
            "OK - deleted config file. You can rerun setup now.",
        )
    }
}
