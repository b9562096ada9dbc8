//! Resilience primitives shared by the browser supervisor and the server
//!
//! Two leaves, no knowledge of browsers or RPC:
//!
//! 1. [`RetryEngine`] - exponential backoff with jitter, textual error
//!    classification, cancellable sleeps
//! 2. [`CircuitBreaker`] - closed / open / half-open gate with a bounded
//!    number of trial calls

pub mod circuit;
pub mod retry;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitError, CircuitState,
    CircuitStats, StateChangeCallback,
};
pub use retry::{RetryEngine, RetryError, RetryPolicy, NETWORK_ERRORS, TRANSIENT_ERRORS};
pub use tokio_util::sync::CancellationToken;
