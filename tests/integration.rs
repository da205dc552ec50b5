//! Integration tests for Wakegate
//!
//! Each test runs a real `ProxyServer` on an ephemeral port. The "gateway" is
//! a real child process (`sleep`) paired with an in-test TCP server that only
//! listens while that process is alive.

#![cfg(unix)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wakegate::pool::PoolConfig;
use wakegate::probe::ReadinessProbe;
use wakegate::process::{CommandSpawner, ExitWatch, LaunchSpec, ProcessHandle, Spawner};
use wakegate::proxy::ProxyServer;
use wakegate::setup::SetupRoutes;
use wakegate::supervisor::{ConfigFile, GatewayState, Supervisor, SupervisorOptions};
use wakegate::token::TokenSource;

const SETUP_PASSWORD: &str = "let-me-in";

/// Counts spawns and serves HTTP on `addr` for as long as each child lives
struct TestGateway {
    addr: SocketAddr,
    listen_delay: Duration,
    serve: bool,
    spawns: AtomicUsize,
}

impl TestGateway {
    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Spawner for TestGateway {
    fn spawn(&self, launch: &LaunchSpec) -> std::io::Result<ProcessHandle> {
        let handle = CommandSpawner.spawn(launch)?;
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.serve {
            tokio::spawn(serve_gateway(self.addr, self.listen_delay, handle.exit_watch()));
        }
        Ok(handle)
    }
}

async fn serve_gateway(addr: SocketAddr, delay: Duration, exit: ExitWatch) {
    tokio::time::sleep(delay).await;

    let mut bound = None;
    for _ in 0..40 {
        if exit.has_exited() {
            return;
        }
        if let Ok(listener) = TcpListener::bind(addr).await {
            bound = Some(listener);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let Some(listener) = bound else { return };

    let exited = exit.wait();
    tokio::pin!(exited);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { return };
                tokio::spawn(handle_gateway_connection(stream));
            }
            _ = &mut exited => return,
        }
    }
}

/// Read up to and including the blank line ending a request/response head
async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => buf.push(byte[0]),
            _ => return None,
        }
        if buf.len() > 16 * 1024 {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&buf).to_string())
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Echoes request details for plain requests; echoes bytes after an upgrade
async fn handle_gateway_connection(mut stream: TcpStream) {
    let Some(head) = read_head(&mut stream).await else { return };

    if header_value(&head, "upgrade") == Some("refuse") {
        // Body arrives in a later segment than the head
        let _ = stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 11\r\nConnection: close\r\n\r\n")
            .await;
        let _ = stream.flush().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = stream.write_all(b"not allowed").await;
        return;
    }

    if header_value(&head, "upgrade").is_some() {
        let _ = stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
            .await;
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        return;
    }

    let path = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let body = format!(
        "path={}\nxff={}\nproto={}\nrequest-id={}\n",
        path,
        header_value(&head, "x-forwarded-for").unwrap_or("-"),
        header_value(&head, "x-forwarded-proto").unwrap_or("-"),
        header_value(&head, "x-request-id").unwrap_or("-"),
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

struct Harness {
    proxy_addr: SocketAddr,
    gateway: Arc<TestGateway>,
    supervisor: Arc<Supervisor>,
    shutdown_tx: watch::Sender<bool>,
    proxy_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    config_path: PathBuf,
    _state: TempDir,
}

struct HarnessOptions {
    program: &'static str,
    args: Vec<&'static str>,
    configured: bool,
    serve: bool,
    listen_delay: Duration,
    startup_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            program: "sleep",
            args: vec!["30"],
            configured: true,
            serve: true,
            listen_delay: Duration::ZERO,
            startup_timeout: Duration::from_secs(5),
        }
    }
}

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_harness(opts: HarnessOptions) -> Harness {
    let state = TempDir::new().unwrap();
    let config_path = state.path().join("gateway.json");
    if opts.configured {
        std::fs::write(&config_path, "{}").unwrap();
    }

    let gateway_addr = free_addr().await;
    let gateway = Arc::new(TestGateway {
        addr: gateway_addr,
        listen_delay: opts.listen_delay,
        serve: opts.serve,
        spawns: AtomicUsize::new(0),
    });

    let options = SupervisorOptions {
        target: gateway_addr,
        launch: LaunchSpec {
            program: opts.program.to_string(),
            args: opts.args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        dirs: vec![state.path().join("workspace")],
        startup_timeout: opts.startup_timeout,
        restart_grace: Duration::from_millis(500),
        probe: ReadinessProbe {
            interval: Duration::from_millis(50),
            ..Default::default()
        },
    };
    let supervisor = Supervisor::new(
        options,
        gateway.clone(),
        Arc::new(ConfigFile::new(&config_path)),
    );

    let setup = SetupRoutes::new(
        Arc::clone(&supervisor),
        Some(SETUP_PASSWORD.to_string()),
        config_path.clone(),
        TokenSource::Generated,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let proxy = ProxyServer::with_pool_config(
        proxy_addr,
        Arc::clone(&supervisor),
        setup,
        shutdown_rx,
        PoolConfig {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );
    let proxy_task = tokio::spawn(proxy.serve(listener));

    Harness {
        proxy_addr,
        gateway,
        supervisor,
        shutdown_tx,
        proxy_task,
        config_path,
        _state: state,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

/// Send a raw request and read until the proxy closes the connection
async fn send_raw(addr: SocketAddr, request: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

async fn http_get(addr: SocketAddr, path: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        path, addr
    );
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    tokio::time::timeout(Duration::from_secs(15), send_raw(addr, &request))
        .await
        .expect("request should complete")
        .expect("request should succeed")
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn basic_auth(password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("admin:{}", password));
    format!("Basic {}", encoded)
}

async fn wait_for_state(supervisor: &Supervisor, state: GatewayState) -> bool {
    for _ in 0..100 {
        if supervisor.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_unconfigured_redirects_to_setup() {
    let harness = start_harness(HarnessOptions {
        configured: false,
        ..Default::default()
    })
    .await;

    for path in ["/", "/anything", "/api/chat?x=1"] {
        let response = http_get(harness.proxy_addr, path, &[]).await;
        assert_eq!(status_of(&response), 302, "{}", response);
        assert!(response.to_lowercase().contains("location: /setup\r\n"));
    }

    assert_eq!(harness.gateway.spawns(), 0);
    assert_eq!(harness.supervisor.state(), GatewayState::Unconfigured);
}

#[tokio::test]
async fn test_first_request_spawns_and_forwards() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(harness.proxy_addr, "/hello?name=world", &[]).await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("path=/hello?name=world\n"));
    assert!(response.contains("proto=http\n"));
    assert_eq!(harness.gateway.spawns(), 1);
    assert_eq!(harness.supervisor.state(), GatewayState::Running);

    // Second request reuses the running gateway
    let response = http_get(harness.proxy_addr, "/again", &[]).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(harness.gateway.spawns(), 1);
    assert_eq!(harness.supervisor.stats().probes(), 1);

    let auth = basic_auth(SETUP_PASSWORD);
    let status = http_get(
        harness.proxy_addr,
        "/setup/api/status",
        &[("Authorization", auth.as_str())],
    )
    .await;
    let body = status.split("\r\n\r\n").nth(1).unwrap_or_default();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["forwarded"]["requests"], 2);
    assert_eq!(json["forwarded"]["failed"], 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_spawn() {
    let harness = start_harness(HarnessOptions {
        listen_delay: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let addr = harness.proxy_addr;
        tasks.push(tokio::spawn(async move {
            http_get(addr, &format!("/req/{}", i), &[]).await
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(status_of(&response), 200, "{}", response);
    }

    assert_eq!(harness.gateway.spawns(), 1);
    assert_eq!(harness.supervisor.stats().probes(), 1);
}

#[tokio::test]
async fn test_crashed_gateway_respawns_on_next_request() {
    let harness = start_harness(HarnessOptions {
        args: vec!["1"],
        ..Default::default()
    })
    .await;

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 200);

    // The child exits on its own; supervisor drops back to Idle
    assert!(wait_for_state(&harness.supervisor, GatewayState::Idle).await);

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(harness.gateway.spawns(), 2);
}

#[tokio::test]
async fn test_not_ready_returns_503() {
    let harness = start_harness(HarnessOptions {
        serve: false,
        startup_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 503, "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: gateway_not_ready"));
    assert!(response.contains("\"code\":\"GATEWAY_NOT_READY\""));

    // Process is kept for a future probe rather than killed
    assert_eq!(harness.supervisor.state(), GatewayState::Starting);
    assert!(harness.supervisor.status().pid.is_some());
}

#[tokio::test]
async fn test_forwarded_for_and_request_id() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(
        harness.proxy_addr,
        "/who",
        &[("X-Forwarded-For", "203.0.113.9"), ("X-Request-Id", "abc-123")],
    )
    .await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("xff=203.0.113.9, 127.0.0.1\n"), "{}", response);
    assert!(response.contains("request-id=abc-123\n"));

    let response = http_get(harness.proxy_addr, "/who", &[]).await;
    assert!(response.contains("xff=127.0.0.1\n"));
    assert!(!response.contains("request-id=-\n"), "request id should be generated");
}

#[tokio::test]
async fn test_upgrade_is_spliced() {
    let harness = start_harness(HarnessOptions::default()).await;

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        harness.proxy_addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = tokio::time::timeout(Duration::from_secs(10), read_head(&mut stream))
        .await
        .unwrap()
        .expect("proxy should answer the upgrade");
    assert_eq!(status_of(&head), 101, "{}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(harness.gateway.spawns(), 1);
}

#[tokio::test]
async fn test_unconfigured_upgrade_closes_connection() {
    let harness = start_harness(HarnessOptions {
        configured: false,
        ..Default::default()
    })
    .await;

    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        harness.proxy_addr
    );
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        send_raw(harness.proxy_addr, &request),
    )
    .await
    .expect("connection should be closed");

    // Either a clean close or a reset, never an HTTP response
    if let Ok(response) = response {
        assert!(!response.starts_with("HTTP/1.1"), "{}", response);
    }
    assert_eq!(harness.gateway.spawns(), 0);
}

async fn send_upgrade(addr: SocketAddr, upgrade: &str) -> std::io::Result<String> {
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: {}\r\n\r\n",
        addr, upgrade
    );
    tokio::time::timeout(Duration::from_secs(10), send_raw(addr, &request))
        .await
        .expect("connection should be closed")
}

#[tokio::test]
async fn test_not_ready_upgrade_closes_connection() {
    let harness = start_harness(HarnessOptions {
        serve: false,
        startup_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let response = send_upgrade(harness.proxy_addr, "websocket").await;
    if let Ok(response) = response {
        assert!(!response.starts_with("HTTP/1.1"), "{}", response);
    }
    assert_eq!(harness.gateway.spawns(), 1);
}

#[tokio::test]
async fn test_spawn_failure_upgrade_closes_connection() {
    let harness = start_harness(HarnessOptions {
        program: "/nonexistent/wakegate-gateway",
        ..Default::default()
    })
    .await;

    let response = send_upgrade(harness.proxy_addr, "websocket").await;
    if let Ok(response) = response {
        assert!(!response.starts_with("HTTP/1.1"), "{}", response);
    }
}

#[tokio::test]
async fn test_spawn_failure_returns_503() {
    let harness = start_harness(HarnessOptions {
        program: "/nonexistent/wakegate-gateway",
        ..Default::default()
    })
    .await;

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 503, "{}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: gateway_start_failed"));
    assert!(response.contains("\"code\":\"GATEWAY_START_FAILED\""));
    assert_eq!(harness.supervisor.state(), GatewayState::Idle);
}

#[tokio::test]
async fn test_refused_upgrade_relays_full_body() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = send_upgrade(harness.proxy_addr, "refuse")
        .await
        .expect("refusal should be relayed");
    assert_eq!(status_of(&response), 403, "{}", response);
    assert!(response.to_lowercase().contains("content-length: 11"), "{}", response);
    assert!(response.ends_with("not allowed"), "{}", response);
}

#[tokio::test]
async fn test_setup_healthz_never_starts_gateway() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(harness.proxy_addr, "/setup/healthz", &[]).await;
    assert_eq!(status_of(&response), 200);
    assert!(response.ends_with(r#"{"ok":true}"#));
    assert_eq!(harness.gateway.spawns(), 0);
}

#[tokio::test]
async fn test_setup_requires_auth() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(harness.proxy_addr, "/setup/api/status", &[]).await;
    assert_eq!(status_of(&response), 401);
    assert!(response.to_lowercase().contains("www-authenticate: basic"));

    let auth = basic_auth(SETUP_PASSWORD);
    let response = http_get(
        harness.proxy_addr,
        "/setup/api/status",
        &[("Authorization", auth.as_str())],
    )
    .await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(response.contains("\"configured\":true"));
    assert_eq!(harness.gateway.spawns(), 0);
}

#[tokio::test]
async fn test_setup_reset_returns_to_redirect() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 200);

    let request = format!(
        "POST /setup/api/reset HTTP/1.1\r\nHost: {}\r\nAuthorization: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        harness.proxy_addr,
        basic_auth(SETUP_PASSWORD)
    );
    let response = send_raw(harness.proxy_addr, &request).await.unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);
    assert!(!harness.config_path.exists());

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 302);
}

#[tokio::test]
async fn test_setup_restart_replaces_gateway() {
    let harness = start_harness(HarnessOptions::default()).await;

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 200);
    let first_pid = harness.supervisor.status().pid;

    let request = format!(
        "POST /setup/api/restart HTTP/1.1\r\nHost: {}\r\nAuthorization: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        harness.proxy_addr,
        basic_auth(SETUP_PASSWORD)
    );
    let response = send_raw(harness.proxy_addr, &request).await.unwrap();
    assert_eq!(status_of(&response), 200, "{}", response);

    assert_ne!(harness.supervisor.status().pid, first_pid);
    assert_eq!(harness.gateway.spawns(), 2);

    let response = http_get(harness.proxy_addr, "/", &[]).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(harness.gateway.spawns(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let mut harness = start_harness(HarnessOptions::default()).await;

    harness.shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), &mut harness.proxy_task)
        .await
        .expect("proxy should stop");
    assert!(result.unwrap().is_ok());
}
