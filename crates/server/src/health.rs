//! Periodic browser health checks through the browser breaker

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use browser::{BrowserError, BrowserSupervisor};
use resilience::{CancellationToken, CircuitBreaker, CircuitError};

/// One `ensure_healthy` round, refused while the breaker is open
pub async fn check_once(
    supervisor: &BrowserSupervisor,
    breaker: &CircuitBreaker,
) -> Result<(), CircuitError<BrowserError>> {
    breaker.call(|| supervisor.ensure_healthy()).await
}

pub async fn run_health_loop(
    supervisor: BrowserSupervisor,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match check_once(&supervisor, &breaker).await {
            Ok(()) => debug!("browser health check passed"),
            Err(e) if e.is_rejected() => debug!(error = %e, "browser health check skipped"),
            Err(e) => warn!(error = %e, "browser health check failed"),
        }
    }
    debug!("health loop exited");
}
