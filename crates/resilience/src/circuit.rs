//! Circuit Breaker - fail fast in front of an unreliable dependency
//!
//! ```text
//! Closed ──(max_failures consecutive failures)──▶ Open
//! Open ──(timeout elapsed, checked lazily)──▶ HalfOpen
//! HalfOpen ──(max_requests trials admitted, all succeeded)──▶ Closed
//! HalfOpen ──(any trial fails)──▶ Open
//! ```
//!
//! The lock is never held across the wrapped call. Results are tagged with
//! the generation they were admitted in, so a slow call that finishes after
//! the breaker has moved on does not count against the new state. A call
//! whose future is dropped before it finishes counts as a failure, which
//! also hands back its half-open trial slot.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("circuit breaker '{name}' is half-open and has no trial slots left")]
    TooManyRequests { name: String },

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// True when the call was refused without running the operation.
    pub fn is_rejected(&self) -> bool {
        !matches!(self, CircuitError::Inner(_))
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures that trip the breaker
    pub max_failures: u32,
    /// How long the breaker stays open before admitting trials
    pub timeout: Duration,
    /// Trial calls admitted while half-open
    pub max_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>, max_failures: u32, timeout: Duration, max_requests: u32) -> Self {
        Self {
            name: name.into(),
            max_failures: max_failures.max(1),
            timeout,
            max_requests: max_requests.max(1),
        }
    }

    pub fn browser() -> Self {
        Self::new("browser", 3, Duration::from_secs(60), 2)
    }

    pub fn network() -> Self {
        Self::new("network", 5, Duration::from_secs(30), 3)
    }
}

/// Invoked synchronously on every transition: `(breaker name, from, to)`.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time view of a breaker, for logging.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trial_requests: u32,
    pub since_last_failure_ms: Option<u64>,
    pub since_transition_ms: u64,
}

struct Counts {
    state: CircuitState,
    generation: u64,
    failures: u32,
    requests: u32,
    successes: u32,
    last_failure: Option<Instant>,
    changed_at: Instant,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    counts: Mutex<Counts>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            counts: Mutex::new(Counts {
                state: CircuitState::Closed,
                generation: 0,
                failures: 0,
                requests: 0,
                successes: 0,
                last_failure: None,
                changed_at: Instant::now(),
            }),
            on_state_change: None,
        }
    }

    pub fn with_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitState {
        let mut counts = self.lock();
        self.refresh(&mut counts, Instant::now());
        counts.state
    }

    pub async fn stats(&self) -> CircuitStats {
        let mut counts = self.lock();
        let now = Instant::now();
        self.refresh(&mut counts, now);
        CircuitStats {
            name: self.config.name.clone(),
            state: counts.state,
            consecutive_failures: counts.failures,
            trial_requests: counts.requests,
            since_last_failure_ms: counts
                .last_failure
                .map(|at| now.duration_since(at).as_millis() as u64),
            since_transition_ms: now.duration_since(counts.changed_at).as_millis() as u64,
        }
    }

    /// Run `operation` if the breaker admits it and record the outcome.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = self.admit()?;
        let result = operation().await;
        trial.finish(result.is_ok());
        result.map_err(CircuitError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit<E>(&self) -> Result<Trial<'_>, CircuitError<E>> {
        let mut counts = self.lock();
        self.refresh(&mut counts, Instant::now());

        match counts.state {
            CircuitState::Closed => Ok(Trial::new(self, counts.generation)),
            CircuitState::Open => Err(CircuitError::Open {
                name: self.config.name.clone(),
            }),
            CircuitState::HalfOpen => {
                if counts.requests >= self.config.max_requests {
                    return Err(CircuitError::TooManyRequests {
                        name: self.config.name.clone(),
                    });
                }
                counts.requests += 1;
                Ok(Trial::new(self, counts.generation))
            }
        }
    }

    fn record(&self, generation: u64, success: bool) {
        let mut counts = self.lock();
        let now = Instant::now();
        self.refresh(&mut counts, now);
        if counts.generation != generation {
            return;
        }

        match (counts.state, success) {
            (CircuitState::Closed, true) => counts.failures = 0,
            (CircuitState::Closed, false) => {
                counts.failures += 1;
                counts.last_failure = Some(now);
                if counts.failures >= self.config.max_failures {
                    self.transition(&mut counts, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                counts.successes += 1;
                if counts.successes >= self.config.max_requests {
                    self.transition(&mut counts, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, false) => {
                counts.failures += 1;
                counts.last_failure = Some(now);
                self.transition(&mut counts, CircuitState::Open, now);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn refresh(&self, counts: &mut Counts, now: Instant) {
        if counts.state == CircuitState::Open
            && now.duration_since(counts.changed_at) >= self.config.timeout
        {
            self.transition(counts, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, counts: &mut Counts, to: CircuitState, now: Instant) {
        let from = counts.state;
        if from == to {
            return;
        }

        counts.state = to;
        counts.generation += 1;
        counts.changed_at = now;
        counts.requests = 0;
        counts.successes = 0;
        if to == CircuitState::Closed {
            counts.failures = 0;
        }

        if let Some(callback) = &self.on_state_change {
            callback(&self.config.name, from, to);
        }
    }
}

/// An admitted call. Dropped without `finish`, it is recorded as failed.
struct Trial<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    finished: bool,
}

impl<'a> Trial<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64) -> Self {
        Self {
            breaker,
            generation,
            finished: false,
        }
    }

    fn finish(mut self, success: bool) {
        self.finished = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.breaker.record(self.generation, false);
        }
    }
}

/// The breakers the server keeps: one for browser operations, one for
/// outbound network checks.
#[derive(Clone)]
pub struct CircuitBreakers {
    pub browser: Arc<CircuitBreaker>,
    pub network: Arc<CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new(browser: CircuitBreakerConfig, network: CircuitBreakerConfig) -> Self {
        let log_transition: StateChangeCallback = Arc::new(|name, from, to| match to {
            CircuitState::Open => {
                tracing::warn!(breaker = name, %from, %to, "circuit breaker opened")
            }
            _ => tracing::info!(breaker = name, %from, %to, "circuit breaker state changed"),
        });

        Self {
            browser: Arc::new(
                CircuitBreaker::new(browser).with_state_change(log_transition.clone()),
            ),
            network: Arc::new(CircuitBreaker::new(network).with_state_change(log_transition)),
        }
    }

    /// `"healthy"` unless one of the breakers is open.
    pub async fn health(&self) -> &'static str {
        let browser_open = self.browser.state().await == CircuitState::Open;
        let network_open = self.network.state().await == CircuitState::Open;
        if browser_open || network_open {
            "degraded"
        } else {
            "healthy"
        }
    }

    pub async fn stats(&self) -> Vec<CircuitStats> {
        vec![self.browser.stats().await, self.network.stats().await]
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::browser(), CircuitBreakerConfig::network())
    }
}
