//! Health checks and the liveness monitor

use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{guarded, BrowserState, BrowserSupervisor};
use crate::error::{BrowserError, Result};
use crate::events::SupervisorEvent;

impl BrowserSupervisor {
    /// One `Browser.getVersion` round trip under the health timeout.
    /// Returns the product string.
    pub async fn check_health(&self) -> Result<String> {
        let browser = self.current_browser().await?;
        let result = guarded(
            "health_check",
            Some(self.inner.config.health_timeout),
            &self.inner.shutdown,
            async move { browser.version().await },
        )
        .await;

        match &result {
            Ok(version) => {
                *self.inner.last_healthy.lock().await = Some(Instant::now());
                let recovered = self.inner.state.send_if_modified(|state| {
                    if *state == BrowserState::Unhealthy {
                        *state = BrowserState::Running;
                        true
                    } else {
                        false
                    }
                });
                if recovered {
                    info!(%version, "browser healthy again");
                }
            }
            Err(e) => self.mark_unhealthy(e.to_string()),
        }
        result
    }

    /// Check, restart on failure, then verify the restart took.
    pub async fn ensure_healthy(&self) -> Result<()> {
        let error = match self.check_health().await {
            Ok(_) => return Ok(()),
            Err(e @ (BrowserError::NotStarted | BrowserError::Failed(_))) => return Err(e),
            Err(e) => e,
        };

        warn!(error = %error, "health check failed, restarting browser");
        self.restart_browser().await?;

        let attempts = self.inner.config.health_verify_attempts.max(1);
        let mut last = error;
        for attempt in 1..=attempts {
            match self.check_health().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(attempt, error = %e, "post-restart health check failed");
                    last = e;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.config.health_verify_interval) => {}
                    _ = self.inner.shutdown.cancelled() => return Err(BrowserError::Cancelled),
                }
            }
        }
        Err(BrowserError::Unhealthy(last.to_string()))
    }

    fn mark_unhealthy(&self, reason: String) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == BrowserState::Running {
                *state = BrowserState::Unhealthy;
                true
            } else {
                false
            }
        });
        if changed {
            warn!(%reason, "browser unhealthy");
            self.inner
                .events
                .publish(SupervisorEvent::Unhealthy { reason });
        }
    }

    /// Poll liveness every `liveness_interval` until shutdown or until the
    /// supervisor is dropped. Replaces any previous monitor.
    pub(super) async fn spawn_monitor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.liveness_interval;
        let token = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let supervisor = BrowserSupervisor { inner };
                if let Some(reason) = supervisor.liveness_problem().await {
                    supervisor.schedule_restart(reason);
                }
            }
            debug!("liveness monitor exited");
        });

        if let Some(previous) = self.inner.monitor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Why the browser needs a restart, if it does
    async fn liveness_problem(&self) -> Option<String> {
        match self.state() {
            BrowserState::Running | BrowserState::Unhealthy => {}
            _ => return None,
        }

        let browser = match self.current_browser().await {
            Ok(browser) => browser,
            Err(_) => return Some("no live browser handle".to_string()),
        };

        // Without a pid only the endpoint half of the check applies
        if let Some(pid) = browser.pid() {
            if !browser.is_running().await {
                return Some(format!("browser process {} exited", pid));
            }
        }

        match self.check_health().await {
            Ok(_) => None,
            Err(e) => {
                let silent_for = self
                    .inner
                    .last_healthy
                    .lock()
                    .await
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if silent_for >= self.inner.config.unresponsive_grace {
                    Some(format!(
                        "control endpoint unresponsive for {}s: {}",
                        silent_for.as_secs(),
                        e
                    ))
                } else {
                    debug!(silent_ms = silent_for.as_millis() as u64, error = %e, "endpoint slow, within grace");
                    None
                }
            }
        }
    }
}
