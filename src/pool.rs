//! Pooled HTTP client for forwarding to the gateway
//!
//! The gateway target never changes for the life of the process, so one
//! client with keep-alive pooling serves every forwarded request.

use crate::error::TransportError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the gateway
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// How long to wait for the gateway's response head
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Keep-alive HTTP connections to the gateway
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    target: SocketAddr,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(target: SocketAddr, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            gateway = %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            target,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to the gateway, keeping method, path, query and headers.
    ///
    /// The response body is streamed back; only the wait for the response
    /// head is bounded by `request_timeout`.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let uri = format!(
            "http://{}{}",
            self.target,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let gateway_req = builder
            .body(body)
            .map_err(|e| TransportError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response =
            match tokio::time::timeout(self.config.request_timeout, self.client.request(gateway_req))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    self.stats.record_failure();
                    return Err(e.into());
                }
                Err(_) => {
                    self.stats.record_failure();
                    return Err(TransportError::Timeout(self.config.request_timeout));
                }
            };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
