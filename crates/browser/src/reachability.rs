//! Destination checks run before a page is pointed at a URL
//!
//! http(s) targets get a bounded HEAD request through the network breaker
//! and the network retry policy. Any HTTP answer counts as reachable; only
//! transport failures don't. Local schemes are trusted.

use resilience::{CancellationToken, CircuitBreaker, RetryEngine, RetryError, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{BrowserError, Result};

const TRUSTED_SCHEMES: &[&str] = &["about", "data", "file", "blob"];
const MAX_REDIRECTS: usize = 5;

pub struct Reachability {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    enabled: bool,
}

impl Reachability {
    pub fn new(timeout: Duration, breaker: Arc<CircuitBreaker>) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            }
        };

        Self {
            client,
            breaker,
            retry: RetryEngine::new(RetryPolicy::network()),
            enabled: true,
        }
    }

    /// Validate URLs without touching the network
    pub fn disabled(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::from_secs(1), breaker)
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryEngine::new(policy);
        self
    }

    pub async fn check(&self, url: &str, token: &CancellationToken) -> Result<()> {
        let parsed = Url::parse(url).map_err(|e| BrowserError::InvalidUrl(format!("{}: {}", url, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme if TRUSTED_SCHEMES.contains(&scheme) => return Ok(()),
            scheme => {
                return Err(BrowserError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    scheme, url
                )))
            }
        }

        if !self.enabled {
            return Ok(());
        }

        let outcome = self
            .retry
            .execute_with_result(token, || {
                let request = self.client.head(parsed.clone());
                self.breaker.call(move || async move { request.send().await })
            })
            .await;

        match outcome {
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "destination reachable");
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(BrowserError::Cancelled),
            Err(e) => Err(BrowserError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resilience::CircuitBreakerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::network()))
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::network()
        }
        .without_jitter()
    }

    #[tokio::test]
    async fn test_local_schemes_are_trusted() {
        let check = Reachability::new(Duration::from_secs(1), breaker());
        let token = CancellationToken::new();
        for url in ["about:blank", "data:text/html,<p>hi</p>", "file:///tmp/index.html"] {
            check.check(url, &token).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_urls() {
        let check = Reachability::disabled(breaker());
        let token = CancellationToken::new();
        assert!(matches!(
            check.check("not a url", &token).await,
            Err(BrowserError::InvalidUrl(_))
        ));
        assert!(matches!(
            check.check("ftp://example.com/file", &token).await,
            Err(BrowserError::InvalidUrl(_))
        ));
        check.check("https://example.com/", &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_server_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let check = Reachability::new(Duration::from_secs(5), breaker()).with_retry(quick_retry());
        check
            .check(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let breaker = breaker();
        let check = Reachability::new(Duration::from_secs(5), breaker.clone()).with_retry(quick_retry());
        let err = check
            .check(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Unreachable { .. }));
        assert_eq!(breaker.stats().await.consecutive_failures, 2);
    }
}
