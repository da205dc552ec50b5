//! Readiness probing for the gateway
//!
//! A probe attempt succeeds as soon as the gateway answers with any HTTP
//! status line, error statuses included. Only connection-level failures
//! (refused, reset, closed without a response, attempt timeout) count as
//! "not ready".

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound for a single connect + response attempt
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Delay between failed attempts
    pub interval: Duration,
    /// Path requested on each attempt
    pub path: String,
    /// Token presented as `Authorization: Bearer`
    pub bearer: Option<String>,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            path: "/".to_string(),
            bearer: None,
        }
    }
}

impl ReadinessProbe {
    /// Poll `target` until it answers or `timeout` elapses.
    ///
    /// Returns `false` no earlier than the deadline and never later than the
    /// deadline plus scheduling slack; every failed attempt is swallowed.
    pub async fn wait_ready(&self, target: SocketAddr, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match tokio::time::timeout_at(deadline, self.check_once(target)).await {
                Ok(true) => {
                    debug!(gateway = %target, attempts, "Gateway answered readiness probe");
                    return true;
                }
                Ok(false) => {}
                Err(_) => break,
            }

            let next = Instant::now() + self.interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        debug!(
            gateway = %target,
            attempts,
            timeout_ms = timeout.as_millis() as u64,
            "Gateway did not answer before deadline"
        );
        false
    }

    /// One connect + request + status line read
    pub async fn check_once(&self, target: SocketAddr) -> bool {
        let mut stream =
            match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(s)) => s,
                Ok(Err(_)) | Err(_) => return false,
            };

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            self.path, target
        );
        if let Some(ref token) = self.bearer {
            request.push_str(&format!("Authorization: Bearer {}\r\n", token));
        }
        request.push_str("\r\n");

        if stream.write_all(request.as_bytes()).await.is_err() {
            return false;
        }

        let read_result = tokio::time::timeout(ATTEMPT_TIMEOUT, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            // Format: "HTTP/1.1 503 Service Unavailable\r\n"; any status will do
            Ok(Ok(status_line)) => status_line.starts_with("HTTP/"),
            _ => false,
        }
    }
}
