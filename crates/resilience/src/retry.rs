//! Retry Engine - exponential backoff with optional jitter
//!
//! Classification is textual on purpose: errors from the CDP socket, the
//! HTTP client and the OS all end up as strings by the time they cross a
//! crate boundary. The lower-cased `Display` output is matched against the
//! policy's retryable substrings; anything that doesn't match is fatal and
//! comes back after the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error texts treated as transient by the default presets.
pub const TRANSIENT_ERRORS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection reset",
    "broken pipe",
    "target closed",
    "page closed",
    "browser not started",
    "websocket closed",
    "connection closed",
    "connection refused",
    "no such host",
    "name resolution",
];

/// Extra texts seen on flaky networks.
pub const NETWORK_ERRORS: &[&str] = &[
    "dns error",
    "network is unreachable",
    "host is unreachable",
    "temporarily unavailable",
    "error sending request",
];

/// Upper bound on the jitter added to a delay, as a fraction of it.
const JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(E),

    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The underlying error, if the operation ever produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Fatal(e) => Some(e),
            RetryError::Exhausted { last, .. } => Some(last),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Backoff policy. Build one from a preset and adjust fields before handing
/// it to a [`RetryEngine`]; the engine never changes it afterwards.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Used in log lines only
    pub name: &'static str,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// Lower-cased substrings that mark an error as retryable
    pub retryable: Vec<String>,
}

impl RetryPolicy {
    pub fn new(
        name: &'static str,
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            name,
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1.0),
            jitter: true,
            retryable: to_owned_lower(TRANSIENT_ERRORS),
        }
    }

    /// Tool-level operations: 3 attempts, 500ms to 5s.
    pub fn tool() -> Self {
        Self::new(
            "tool",
            3,
            Duration::from_millis(500),
            Duration::from_secs(5),
            2.0,
        )
    }

    /// Browser operations: 5 quick attempts, 250ms to 3s.
    pub fn browser() -> Self {
        Self::new(
            "browser",
            5,
            Duration::from_millis(250),
            Duration::from_secs(3),
            1.5,
        )
    }

    /// Critical operations: 2 attempts, deterministic, narrow retryable set.
    pub fn critical() -> Self {
        Self {
            jitter: false,
            retryable: to_owned_lower(&["timeout", "connection reset"]),
            ..Self::new(
                "critical",
                2,
                Duration::from_secs(1),
                Duration::from_secs(2),
                2.0,
            )
        }
    }

    /// Network operations: 4 attempts, 1s to 10s for intermittent connectivity.
    pub fn network() -> Self {
        let mut policy = Self::new(
            "network",
            4,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
        );
        policy.retryable.extend(to_owned_lower(NETWORK_ERRORS));
        policy
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_retryable(mut self, patterns: &[&str]) -> Self {
        self.retryable = to_owned_lower(patterns);
        self
    }

    /// Deterministic delay after the failed attempt `attempt` (0-indexed):
    /// `min(max_delay, initial_delay * multiplier^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;
        let exp = attempt.min(64) as i32;
        let nanos = (initial * self.multiplier.powi(exp)).min(max);
        Duration::from_nanos(nanos as u64)
    }

    /// `backoff` plus up to 25% random extra when jitter is enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        base + base.mul_f64(extra)
    }

    pub fn is_retryable(&self, error: &impl Display) -> bool {
        let text = error.to_string().to_lowercase();
        self.retryable.iter().any(|pattern| text.contains(pattern.as_str()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::tool()
    }
}

fn to_owned_lower(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, runs out of
    /// attempts or `token` is cancelled.
    pub async fn execute<F, Fut, E>(
        &self,
        token: &CancellationToken,
        operation: F,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.execute_with_result(token, operation).await
    }

    pub async fn execute_with_result<T, F, Fut, E>(
        &self,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let policy = &self.policy;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            policy = policy.name,
                            attempts = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            attempt += 1;

            if !policy.is_retryable(&error) {
                debug!(policy = policy.name, attempt, error = %error, "non-retryable error");
                return Err(RetryError::Fatal(error));
            }

            if attempt >= policy.max_attempts {
                warn!(
                    policy = policy.name,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "operation failed after all retry attempts"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = policy.delay_for(attempt - 1);
            debug!(
                policy = policy.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );

            tokio::select! {
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        )
        .without_jitter()
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = quick_policy(6);
        let delays: Vec<_> = (0..5).map(|i| policy.backoff(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::tool();
        for attempt in 0..4 {
            let base = policy.backoff(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(JITTER_FRACTION));
        }
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        let policy = RetryPolicy::tool();
        assert!(policy.is_retryable(&"WebSocket Closed by peer"));
        assert!(policy.is_retryable(&"request Timeout after 5s"));
        assert!(!policy.is_retryable(&"invalid argument: url"));

        let critical = RetryPolicy::critical();
        assert!(!critical.is_retryable(&"broken pipe"));
        assert!(critical.is_retryable(&"connection reset by peer"));

        assert!(RetryPolicy::network().is_retryable(&"dns error: failed to lookup"));
    }

    #[test]
    fn test_presets() {
        let tool = RetryPolicy::tool();
        assert_eq!(tool.max_attempts, 3);
        assert_eq!(tool.initial_delay, Duration::from_millis(500));
        assert_eq!(tool.max_delay, Duration::from_secs(5));

        let browser = RetryPolicy::browser();
        assert_eq!(browser.max_attempts, 5);
        assert!(browser.multiplier < tool.multiplier);

        let critical = RetryPolicy::critical();
        assert_eq!(critical.max_attempts, 2);
        assert!(!critical.jitter);

        let network = RetryPolicy::network();
        assert_eq!(network.max_attempts, 4);
        assert_eq!(network.max_delay, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_after_one_attempt() {
        let engine = RetryEngine::new(quick_policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result = engine
            .execute(&CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("invalid tool arguments".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let engine = RetryEngine::new(quick_policy(5));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let value = engine
            .execute_with_result(&CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_final_attempt() {
        let engine = RetryEngine::new(quick_policy(3));
        let started = Instant::now();

        let result = engine
            .execute(&CancellationToken::new(), || async {
                Err::<(), _>("timeout waiting for target".to_string())
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("timeout"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        // 100ms + 200ms between the three attempts, nothing after the last
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let engine = RetryEngine::new(
            RetryPolicy::new(
                "slow",
                3,
                Duration::from_secs(10),
                Duration::from_secs(10),
                2.0,
            )
            .without_jitter(),
        );
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = engine
            .execute(&token, || async { Err::<(), _>("broken pipe".to_string()) })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_operation() {
        let engine = RetryEngine::new(quick_policy(3));
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute(&token, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), String>(()) }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exhausted_error_keeps_the_cause_text() {
        let err: RetryError<String> = RetryError::Exhausted {
            attempts: 4,
            last: "websocket closed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "operation failed after 4 attempts: websocket closed"
        );
        assert_eq!(err.into_inner().as_deref(), Some("websocket closed"));
    }
}
