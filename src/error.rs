//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why the supervisor could not produce a running gateway.
///
/// `Clone` because a single start attempt hands the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The system has no configuration yet; nothing should be started
    #[error("gateway is not configured")]
    NotConfigured,
    /// The OS refused to create the gateway process
    #[error("failed to spawn gateway: {0}")]
    SpawnFailure(String),
    /// The process exists (or existed) but never accepted connections in time
    #[error("gateway not ready: {0}")]
    NotReady(String),
}

/// Forwarding to an already running gateway failed
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Error from the pooled HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the outbound request
    #[error("request build error: {0}")]
    RequestBuild(String),
    /// No response head within the configured request timeout
    #[error("gateway did not respond within {0:?}")]
    Timeout(std::time::Duration),
}

impl From<&TransportError> for ProxyErrorCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Client(_) => ProxyErrorCode::ConnectionFailed,
            TransportError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            TransportError::RequestBuild(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Gateway was spawned but is not accepting connections
    GatewayNotReady,
    /// Gateway process could not be started
    GatewayStartFailed,
    /// Request timed out waiting for the gateway's response
    RequestTimeout,
    /// Failed to reach the running gateway
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::GatewayNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::GatewayStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::GatewayNotReady => "GATEWAY_NOT_READY",
            ProxyErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&StartError> for ProxyErrorCode {
    fn from(err: &StartError) -> Self {
        match err {
            StartError::NotReady(_) => ProxyErrorCode::GatewayNotReady,
            StartError::SpawnFailure(_) => ProxyErrorCode::GatewayStartFailed,
            // Callers redirect instead; reaching here means the config vanished mid-request
            StartError::NotConfigured => ProxyErrorCode::GatewayNotReady,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Map a failed start to the 503 the router sends back
pub fn start_error_response(err: &StartError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(ProxyErrorCode::from(err), err.to_string())
}
