//! Health prober

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::OrchestratorError;
use crate::utils::{poll_until, PollOutcome};

/// Per-request timeout of a single probe
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Waits for an HTTP endpoint to answer
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True once the endpoint returns 2xx; false on timeout or cancellation
    async fn wait_healthy(
        &self,
        endpoint: &Url,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool;
}

/// Polls with reqwest
pub struct HttpHealthProber {
    client: Client,
    poll_interval: Duration,
}

impl HttpHealthProber {
    pub fn new(poll_interval: Duration) -> Result<Self, OrchestratorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            poll_interval,
        })
    }

    /// One probe; connection failures count as not ready yet
    async fn probe_once(&self, endpoint: &Url) -> bool {
        match self.client.get(endpoint.clone()).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("Health probe {} returned {}", endpoint, response.status());
                false
            }
            Err(e) => {
                debug!("Health probe {} not reachable yet: {}", endpoint, e);
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProber {
    async fn wait_healthy(
        &self,
        endpoint: &Url,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        info!("Waiting up to {:?} for {} to report healthy", timeout, endpoint);

        let outcome =
            poll_until(timeout, self.poll_interval, cancel, || self.probe_once(endpoint)).await;
        match outcome {
            PollOutcome::Ready => {
                info!("{} is healthy", endpoint);
                true
            }
            PollOutcome::TimedOut => {
                warn!("{} did not become healthy within {:?}", endpoint, timeout);
                false
            }
            PollOutcome::Cancelled => {
                warn!("Health check of {} cancelled", endpoint);
                false
            }
        }
    }
}

/// Endpoint the prober hits for a deployment published on `port`
pub fn health_endpoint(port: u16, path: &str) -> Result<Url, OrchestratorError> {
    let raw = format!("http://127.0.0.1:{}{}", port, path);
    Url::parse(&raw).map_err(|e| {
        OrchestratorError::ConfigError(format!("invalid health endpoint {}: {}", raw, e))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answers 503 for the first `failures` requests, then 200
    async fn serve(failures: usize) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let status = if n < failures { "503 Service Unavailable" } else { "200 OK" };
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (port, hits)
    }

    #[test]
    fn test_health_endpoint() {
        let url = health_endpoint(8080, "/health").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/health");
    }

    #[tokio::test]
    async fn test_waits_through_unhealthy_responses() {
        let (port, hits) = serve(2).await;
        let prober = HttpHealthProber::new(Duration::from_millis(20)).unwrap();
        let url = health_endpoint(port, "/health").unwrap();

        let healthy = prober
            .wait_healthy(&url, Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(healthy);
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_refused_connection_times_out() {
        // Grab a free port and release it so nothing listens there
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let prober = HttpHealthProber::new(Duration::from_millis(20)).unwrap();
        let url = health_endpoint(port, "/health").unwrap();

        let healthy = prober
            .wait_healthy(&url, Duration::from_millis(200), &CancellationToken::new())
            .await;

        assert!(!healthy);
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_unhealthy() {
        let (port, _) = serve(usize::MAX).await;
        let prober = HttpHealthProber::new(Duration::from_millis(20)).unwrap();
        let url = health_endpoint(port, "/health").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let healthy = prober.wait_healthy(&url, Duration::from_secs(5), &cancel).await;
        assert!(!healthy);
    }
}
