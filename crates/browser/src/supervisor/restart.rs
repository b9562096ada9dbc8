//! Guarded browser restarts
//!
//! Restarts are spaced by a doubling floor (1s, 2s, 4s ... capped) measured
//! from the previous restart, so a crash loop cannot turn into a restart
//! storm. The counter forgets after a stable period.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::{BrowserState, BrowserSupervisor, PageEntry};
use crate::error::{BrowserError, Result};
use crate::events::SupervisorEvent;
use crate::page::PageState;

/// Restart bookkeeping, behind its own lock
#[derive(Debug)]
pub(crate) struct RestartTracker {
    base_delay: Duration,
    max_delay: Duration,
    stable_period: Duration,
    count: u32,
    consecutive_failures: u32,
    last_restart: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RestartTicket {
    pub attempt: u32,
    /// Backoff still owed before this restart may launch
    pub wait: Duration,
}

impl RestartTracker {
    pub(crate) fn new(base_delay: Duration, max_delay: Duration, stable_period: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            stable_period,
            count: 0,
            consecutive_failures: 0,
            last_restart: None,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Count a new restart and work out how long it has to wait
    pub(crate) fn begin(&mut self, now: Instant) -> RestartTicket {
        if let Some(last) = self.last_restart {
            if now.duration_since(last) >= self.stable_period {
                self.count = 0;
                self.last_restart = None;
            }
        }
        self.count += 1;

        let wait = match self.last_restart {
            Some(last) => (last + self.spacing(self.count)).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        RestartTicket {
            attempt: self.count,
            wait,
        }
    }

    /// Minimum gap between restart `attempt - 1` and restart `attempt`
    fn spacing(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub(crate) fn mark_started(&mut self, now: Instant) {
        self.last_restart = Some(now);
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
        self.consecutive_failures = 0;
        self.last_restart = None;
    }
}

impl BrowserSupervisor {
    /// Replace the browser process, carrying open pages over at their last
    /// URLs. Concurrent callers coalesce: whoever waited on the gate while
    /// another restart succeeded returns without restarting again.
    pub async fn restart_browser(&self) -> Result<()> {
        let observed = self.inner.runtime.read().await.generation;
        let _gate = self.inner.restart_gate.lock().await;

        {
            let runtime = self.inner.runtime.read().await;
            if runtime.generation != observed
                && runtime.browser.is_some()
                && self.state() == BrowserState::Running
            {
                return Ok(());
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(BrowserError::Cancelled);
        }

        let admitted = self.inner.state.send_if_modified(|state| match state {
            BrowserState::Running | BrowserState::Unhealthy | BrowserState::Restarting => {
                *state = BrowserState::Restarting;
                true
            }
            _ => false,
        });
        if !admitted {
            return match self.state() {
                BrowserState::Failed => Err(BrowserError::Failed(
                    self.inner.restarts.lock().await.consecutive_failures(),
                )),
                _ => Err(BrowserError::NotStarted),
            };
        }

        let ticket = self.inner.restarts.lock().await.begin(Instant::now());
        self.inner
            .events
            .publish(SupervisorEvent::Restarting { attempt: ticket.attempt });

        if !ticket.wait.is_zero() {
            info!(attempt = ticket.attempt, wait_ms = ticket.wait.as_millis() as u64, "waiting out restart backoff");
            tokio::select! {
                _ = tokio::time::sleep(ticket.wait) => {}
                _ = self.inner.shutdown.cancelled() => return Err(BrowserError::Cancelled),
            }
        }
        self.inner.restarts.lock().await.mark_started(Instant::now());

        // Take the old browser and its pages out, then let readers in while
        // the slow part runs.
        let (entries, captured, old_browser, retired) = {
            let mut runtime = self.inner.runtime.write().await;
            // stop() may have run while we slept
            if self.state() != BrowserState::Restarting {
                return Err(BrowserError::NotStarted);
            }
            let entries: Vec<PageEntry> = runtime.pages.drain().map(|(_, entry)| entry).collect();
            let mut captured: Vec<PageState> = std::mem::take(&mut runtime.orphans);
            captured.extend(entries.iter().map(|entry| entry.state.clone()));
            let old_browser = runtime.browser.take();
            // Anything opened against the old handle must not be installed
            runtime.generation += 1;
            (entries, captured, old_browser, runtime.generation)
        };

        warn!(
            attempt = ticket.attempt,
            pages = captured.len(),
            "restarting browser"
        );
        self.close_pages(entries).await;
        if let Some(browser) = old_browser {
            self.close_browser(browser).await;
        }
        let launched = self.launch().await;

        let mut runtime = self.inner.runtime.write().await;
        if self.state() != BrowserState::Restarting || runtime.generation != retired {
            drop(runtime);
            warn!("supervisor stopped during restart, discarding the new browser");
            if let Ok(browser) = launched {
                self.close_browser(browser).await;
            }
            return Err(BrowserError::NotStarted);
        }

        match launched {
            Ok(browser) => {
                let generation = self.install(&mut runtime, browser.clone());
                let restored_pages = self.restore_pages(&mut runtime, &browser, captured).await;
                self.set_state(BrowserState::Running);
                drop(runtime);

                self.inner.restarts.lock().await.record_success();
                *self.inner.last_healthy.lock().await = Some(Instant::now());
                info!(generation, restored_pages, "browser restarted");
                self.inner.events.publish(SupervisorEvent::Restarted {
                    generation,
                    restored_pages,
                });
                Ok(())
            }
            Err(e) => {
                runtime.orphans = captured;
                let failures = self.inner.restarts.lock().await.record_failure();
                if failures >= self.inner.config.max_restart_attempts {
                    self.set_state(BrowserState::Failed);
                    drop(runtime);
                    error!(
                        failures,
                        error = %e,
                        "browser restart limit exceeded, giving up"
                    );
                    self.inner
                        .events
                        .publish(SupervisorEvent::Failed { attempts: failures });
                    return Err(BrowserError::Failed(failures));
                }
                self.set_state(BrowserState::Unhealthy);
                drop(runtime);
                warn!(failures, error = %e, "browser restart failed");
                Err(e)
            }
        }
    }

    /// Restart in the background; used by the liveness monitor
    pub(crate) fn schedule_restart(&self, reason: String) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            warn!(%reason, "scheduling browser restart");
            if let Err(e) = supervisor.restart_browser().await {
                warn!(error = %e, "scheduled browser restart failed");
            }
        });
    }
}
