//! Reachability checks for the deployed API.
//!
//! The API host only needs its port open; `status --health` probes
//! `http://{apiIp}:{port}{health_path}` to confirm the service answers.

use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{BackendError, Result, StackError};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Probed URL.
    pub url: String,
    /// Whether the endpoint answered with a success status.
    pub healthy: bool,
    /// HTTP status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response time in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Error message (if any).
    pub error: Option<String>,
}

/// HTTP health checker.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    /// Creates a checker with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a checker with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS).min(timeout))
            .build()
            .map_err(|e| StackError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// URL of the API health endpoint.
    #[must_use]
    pub fn api_url(host: &str, port: u16, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if port == 80 {
            format!("http://{host}{path}")
        } else {
            format!("http://{host}:{port}{path}")
        }
    }

    /// Probes a URL once.
    pub async fn check(&self, url: &str) -> HealthStatus {
        let start = Instant::now();
        debug!("Probing {url}");

        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = status.is_success();
                if !healthy {
                    debug!("{url} returned status {status}");
                }
                HealthStatus {
                    url: url.to_string(),
                    healthy,
                    status_code: Some(status.as_u16()),
                    response_time_ms: Some(
                        u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    ),
                    error: (!healthy).then(|| format!("HTTP {status}")),
                }
            }
            Err(e) => {
                warn!("Health check failed for {url}: {e}");
                HealthStatus {
                    url: url.to_string(),
                    healthy: false,
                    status_code: None,
                    response_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probes until healthy or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the endpoint never became healthy.
    pub async fn wait_for_healthy(
        &self,
        url: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<HealthStatus> {
        let start = Instant::now();
        loop {
            let status = self.check(url).await;
            if status.healthy {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                return Err(BackendError::Timeout {
                    resource: url.to_string(),
                    expected_state: String::from("healthy"),
                }
                .into());
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy { "healthy" } else { "unhealthy" };
        write!(f, "{}: {status}", self.url)?;
        if let Some(ms) = self.response_time_ms {
            write!(f, " ({ms} ms)")?;
        }
        if let Some(error) = &self.error {
            write!(f, " - {error}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let checker = HealthChecker::new().unwrap();
        let status = checker.check(&format!("{}/health", server.uri())).await;

        assert!(status.healthy);
        assert_eq!(status.status_code, Some(200));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let checker = HealthChecker::new().unwrap();
        let status = checker.check(&format!("{}/health", server.uri())).await;

        assert!(!status.healthy);
        assert_eq!(status.status_code, Some(503));
        assert!(status.to_string().contains("unhealthy"));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let checker = HealthChecker::with_timeout(Duration::from_millis(500)).unwrap();
        let status = checker.check("http://127.0.0.1:1/health").await;

        assert!(!status.healthy);
        assert!(status.status_code.is_none());
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_healthy_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = HealthChecker::new().unwrap();
        let result = checker
            .wait_for_healthy(
                &server.uri(),
                Duration::from_millis(10),
                Duration::from_millis(50),
            )
            .await;

        assert!(matches!(
            result,
            Err(StackError::Backend(BackendError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_api_url() {
        assert_eq!(
            HealthChecker::api_url("203.0.113.10", 80, "/health"),
            "http://203.0.113.10/health"
        );
        assert_eq!(
            HealthChecker::api_url("203.0.113.10", 8080, "health"),
            "http://203.0.113.10:8080/health"
        );
    }
}
