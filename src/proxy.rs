//! Public-facing router and reverse proxy
//!
//! Per request: setup namespace first, then the configuration gate, then
//! `ensure_running`, then forwarding. Plain HTTP goes through the pooled
//! client; upgrades (WebSocket and friends) are replayed over a raw TCP
//! connection and spliced once the gateway answers `101`.

use crate::error::{json_error_response, start_error_response, ProxyErrorCode, StartError};
use crate::pool::{empty, full, ConnectionPool, PoolConfig, ProxyBody};
use crate::setup::{is_setup_path, SetupRoutes, SETUP_PREFIX};
use crate::supervisor::Supervisor;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Largest upgrade response head accepted from the gateway
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Largest body relayed when the gateway refuses an upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// How long to wait for the rest of a refused upgrade's body
const REJECTION_BODY_TIMEOUT: Duration = Duration::from_secs(10);

/// Returned from the service to make hyper drop the client connection
/// without writing a response.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("upgrade refused: {0}")]
    UpgradeRefused(String),
}

/// Everything a request handler needs, shared by all connections
struct Router {
    supervisor: Arc<Supervisor>,
    setup: SetupRoutes,
    pool: ConnectionPool,
}

/// The public proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        setup: SetupRoutes,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(
            bind_addr,
            supervisor,
            setup,
            shutdown_rx,
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        mut setup: SetupRoutes,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = ConnectionPool::new(supervisor.target(), pool_config);
        setup.attach_pool_stats(pool.stats());
        Self {
            bind_addr,
            router: Arc::new(Router {
                supervisor,
                setup,
                pool,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            gateway = %self.router.supervisor.target(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, local_addr.port(), router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    local_port: u16,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr, local_port).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    client_addr: SocketAddr,
    local_port: u16,
) -> Result<Response<ProxyBody>, RouteError> {
    if is_setup_path(req.uri().path()) {
        // Setup endpoints never read request bodies
        let (parts, _body) = req.into_parts();
        let req = Request::from_parts(parts, ());
        return Ok(router.setup.handle(&req).await);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let upgrade = is_upgrade_request(&req);

    debug!(method = %req.method(), uri = %req.uri(), request_id, upgrade, "Incoming request");

    if !router.supervisor.is_configured() {
        return refuse_unconfigured(upgrade, &request_id);
    }

    match router.supervisor.ensure_running().await {
        Ok(_) => {}
        Err(StartError::NotConfigured) => return refuse_unconfigured(upgrade, &request_id),
        Err(e) => {
            error!(request_id, error = %e, "Gateway unavailable");
            if upgrade {
                return Err(RouteError::UpgradeRefused(e.to_string()));
            }
            return Ok(start_error_response(&e));
        }
    }

    set_forwarded_headers(req.headers_mut(), client_addr, local_port, &request_id);

    if upgrade {
        return Ok(handle_upgrade(req, router.pool.target(), request_id).await);
    }

    let req = req.map(|body| body.boxed());
    match router.pool.send_request(req).await {
        Ok(response) => Ok(response),
        Err(e) => {
            let code = ProxyErrorCode::from(&e);
            error!(request_id, gateway = %router.pool.target(), error = %e, "Failed to forward request");
            Ok(json_error_response(code, e.to_string()))
        }
    }
}

fn refuse_unconfigured(
    upgrade: bool,
    request_id: &str,
) -> Result<Response<ProxyBody>, RouteError> {
    if upgrade {
        debug!(request_id, "Refusing upgrade, gateway not configured");
        return Err(RouteError::UpgradeRefused(
            "gateway is not configured".to_string(),
        ));
    }
    debug!(request_id, "Gateway not configured, redirecting to setup");
    Ok(redirect_to_setup())
}

fn redirect_to_setup() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, SETUP_PREFIX)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full("Redirecting to /setup"))
        .expect("valid response builder")
}

/// Add request id and forwarding headers. X-Forwarded-For is appended to;
/// the others are only set when the client did not send them.
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    local_port: u16,
    request_id: &str,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if !headers.contains_key(X_FORWARDED_PORT) {
        headers.insert(X_FORWARDED_PORT, HeaderValue::from(local_port));
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP/1.1 upgrade request replayed to the gateway
fn build_upgrade_request<B>(req: &Request<B>, target: SocketAddr) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        request.push_str(&format!("host: {}\r\n", target));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read the gateway's response head. Returns the head (without the blank
/// line) and any bytes that arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "gateway closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Read the rest of a refused upgrade's body. Only `Content-Length` framed
/// bodies are completed; otherwise whatever arrived with the head is kept.
async fn read_rejection_body(
    stream: &mut TcpStream,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());
    let Some(content_length) = content_length else {
        return Ok(body);
    };

    let limit = content_length.min(MAX_REJECTION_BODY);
    let mut chunk = [0u8; 4096];
    while body.len() < limit {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "gateway closed connection mid-body",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(limit);
    Ok(body)
}

/// Parse the status line and headers of a raw response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    target: SocketAddr,
    request_id: String,
) -> Response<ProxyBody> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, target);

    let mut gateway = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(request_id, gateway = %target, error = %e, "Failed to connect to gateway for upgrade");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to gateway: {}", e),
            );
        }
    };

    if let Err(e) = gateway.write_all(&raw_request).await {
        error!(request_id, error = %e, "Failed to send upgrade request to gateway");
        return json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        );
    }

    let (head, early_data) = match read_response_head(&mut gateway).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(request_id, error = %e, "Failed to read upgrade response from gateway");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read gateway response: {}", e),
            );
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(request_id, "Failed to parse gateway upgrade response");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            );
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %status, "Gateway rejected upgrade request");
        let body = match tokio::time::timeout(
            REJECTION_BODY_TIMEOUT,
            read_rejection_body(&mut gateway, &response_headers, early_data),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                error!(request_id, error = %e, "Failed to read gateway rejection body");
                return json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    format!("Failed to read gateway response: {}", e),
                );
            }
            Err(_) => {
                error!(request_id, "Timed out reading gateway rejection body");
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    "Timed out reading gateway response",
                );
            }
        };
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            let name_lower = name.to_ascii_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(full(body))
            .unwrap_or_else(|_| {
                json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid gateway response")
            });
    }

    info!(request_id, upgrade_type, "Upgrade accepted by gateway");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_ascii_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = match response.body(empty()) {
        Ok(response) => response,
        Err(e) => {
            error!(request_id, error = %e, "Invalid upgrade response headers");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            );
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, splicing streams");
                splice(upgraded, gateway, early_data, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Relay bytes in both directions until either side closes
async fn splice(client: Upgraded, mut gateway: TcpStream, early_data: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(request_id, error = %e, "Client went away before early gateway data");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut gateway).await {
        Ok((client_to_gateway, gateway_to_client)) => {
            debug!(
                request_id,
                client_to_gateway,
                gateway_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
