//! Browser Supervisor - owns the one browser process and every page opened in it
//!
//! State lives in a single `RwLock<Runtime>`: the live browser handle, its
//! generation, the page map and the alias table. Page operations hold the
//! read guard while they run; recovery and stop take the write guard, so a
//! page is never driven and replaced at the same time. A restart takes the
//! write guard only to swap handles. While it closes and launches, the lock
//! is free and page lookups park on the restart gate instead.
//!
//! Lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running <-> Unhealthy -> Restarting -> Running | Stopped
//!                                                      \-> Failed (terminal)
//! ```

mod health;
mod pages;
mod restart;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use resilience::{CancellationToken, CircuitBreaker, CircuitBreakerConfig};

use crate::driver::{Browser, BrowserLauncher, Page};
use crate::error::{BrowserError, Result};
use crate::events::{EventBus, SupervisorEvent};
use crate::launcher::LaunchConfig;
use crate::page::{PageId, PageState};
use crate::reachability::Reachability;
use crate::util::{duration_ms, panic_message};

use restart::RestartTracker;

/// Longest alias chain followed when resolving a retired page id
const MAX_ALIAS_HOPS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub launch: LaunchConfig,
    /// Bound on one launch, browser download included
    #[serde(with = "duration_ms")]
    pub launch_timeout: Duration,
    /// Bound on every page operation
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_timeout: Duration,
    /// Bound on the script probe run before each page operation
    #[serde(with = "duration_ms")]
    pub page_probe_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub liveness_interval: Duration,
    /// How long the endpoint may stay unresponsive before a restart
    #[serde(with = "duration_ms")]
    pub unresponsive_grace: Duration,
    #[serde(with = "duration_ms")]
    pub restart_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub restart_max_delay: Duration,
    /// Restart counter resets after this long without restarts
    #[serde(with = "duration_ms")]
    pub restart_stable_period: Duration,
    /// Consecutive failed restarts before giving up for good
    pub max_restart_attempts: u32,
    pub health_verify_attempts: u32,
    #[serde(with = "duration_ms")]
    pub health_verify_interval: Duration,
    #[serde(with = "duration_ms")]
    pub reachability_timeout: Duration,
    /// HEAD-check http(s) destinations before using them
    pub check_reachability: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            launch_timeout: Duration::from_secs(180),
            operation_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            page_probe_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(10),
            unresponsive_grace: Duration::from_secs(30),
            restart_base_delay: Duration::from_secs(1),
            restart_max_delay: Duration::from_secs(30),
            restart_stable_period: Duration::from_secs(300),
            max_restart_attempts: 5,
            health_verify_attempts: 3,
            health_verify_interval: Duration::from_secs(1),
            reachability_timeout: Duration::from_secs(10),
            check_reachability: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Restarting,
    /// Restart limit exceeded; only an explicit `start()` leaves this state
    Failed,
}

/// Snapshot of the browser process handle
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub state: BrowserState,
    pub generation: u64,
    pub endpoint: Option<String>,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub consecutive_restart_failures: u32,
    pub since_last_healthy_ms: Option<u64>,
    pub pages: usize,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub slow_motion_ms: u64,
    pub debug: bool,
}

pub(crate) struct PageEntry {
    pub(crate) page: Arc<dyn Page>,
    pub(crate) state: PageState,
}

/// Everything guarded by the supervisor lock
#[derive(Default)]
pub(crate) struct Runtime {
    pub(crate) browser: Option<Arc<dyn Browser>>,
    /// Bumped whenever the browser handle is replaced or released
    pub(crate) generation: u64,
    pub(crate) pages: HashMap<PageId, PageEntry>,
    /// Retired id -> replacement id
    pub(crate) aliases: HashMap<PageId, PageId>,
    /// Pages captured by a restart whose relaunch failed
    pub(crate) orphans: Vec<PageState>,
}

impl Runtime {
    /// Follow aliases to the live id for `id`
    pub(crate) fn resolve(&self, id: &PageId) -> Option<PageId> {
        let mut current = id;
        for _ in 0..MAX_ALIAS_HOPS {
            if self.pages.contains_key(current) {
                return Some(current.clone());
            }
            current = self.aliases.get(current)?;
        }
        None
    }

    /// Alias `old` to `new`. Ids that led to `old` are re-pointed at `new`
    /// so chains stay one hop long.
    pub(crate) fn retire(&mut self, old: &PageId, new: &PageId) {
        for target in self.aliases.values_mut() {
            if target == old {
                *target = new.clone();
            }
        }
        self.aliases.insert(old.clone(), new.clone());
    }

    /// Drop every alias that leads to `id`
    pub(crate) fn forget(&mut self, id: &PageId) {
        let stale: Vec<PageId> = self
            .aliases
            .keys()
            .filter(|alias| self.leads_to(alias, id))
            .cloned()
            .collect();
        for alias in stale {
            self.aliases.remove(&alias);
        }
    }

    fn leads_to(&self, from: &PageId, id: &PageId) -> bool {
        let mut current = from;
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(current) {
                Some(next) if next == id => return true,
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn BrowserLauncher>,
    reachability: Reachability,
    runtime: RwLock<Runtime>,
    restarts: Mutex<RestartTracker>,
    /// Serializes start and whole restarts
    restart_gate: Mutex<()>,
    state: watch::Sender<BrowserState>,
    events: EventBus,
    /// Server-wide shutdown; page tokens are children of it
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    last_healthy: Mutex<Option<Instant>>,
}

/// Cheap to clone; all clones share one browser
#[derive(Clone)]
pub struct BrowserSupervisor {
    inner: Arc<Inner>,
}

impl BrowserSupervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self::with_dependencies(
            config,
            launcher,
            Arc::new(CircuitBreaker::new(CircuitBreakerConfig::network())),
            CancellationToken::new(),
        )
    }

    /// Build with a shared network breaker and the server's shutdown token
    pub fn with_dependencies(
        config: SupervisorConfig,
        launcher: Arc<dyn BrowserLauncher>,
        network_breaker: Arc<CircuitBreaker>,
        shutdown: CancellationToken,
    ) -> Self {
        let reachability = if config.check_reachability {
            Reachability::new(config.reachability_timeout, network_breaker)
        } else {
            Reachability::disabled(network_breaker)
        };
        let restarts = RestartTracker::new(
            config.restart_base_delay,
            config.restart_max_delay,
            config.restart_stable_period,
        );
        let (state, _) = watch::channel(BrowserState::Stopped);

        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                reachability,
                runtime: RwLock::new(Runtime::default()),
                restarts: Mutex::new(restarts),
                restart_gate: Mutex::new(()),
                state,
                events: EventBus::new(),
                shutdown,
                monitor: Mutex::new(None),
                last_healthy: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn state(&self) -> BrowserState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BrowserState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Launch the browser and begin liveness polling. Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        let _gate = self.inner.restart_gate.lock().await;

        let admitted = self.inner.state.send_if_modified(|state| match state {
            BrowserState::Stopped | BrowserState::Failed => {
                *state = BrowserState::Starting;
                true
            }
            _ => false,
        });
        if !admitted {
            debug!(state = ?self.state(), "start ignored, browser already managed");
            return Ok(());
        }
        self.inner.restarts.lock().await.reset();

        let browser = match self.launch().await {
            Ok(browser) => browser,
            Err(e) => {
                error!(error = %e, "browser failed to start");
                self.set_state(BrowserState::Stopped);
                return Err(e);
            }
        };

        let (generation, restored) = {
            let mut runtime = self.inner.runtime.write().await;
            let orphans = std::mem::take(&mut runtime.orphans);
            let generation = self.install(&mut runtime, browser.clone());
            let restored = self.restore_pages(&mut runtime, &browser, orphans).await;
            self.set_state(BrowserState::Running);
            (generation, restored)
        };
        *self.inner.last_healthy.lock().await = Some(Instant::now());
        self.spawn_monitor().await;

        info!(
            generation,
            endpoint = browser.endpoint(),
            pid = ?browser.pid(),
            restored,
            "browser supervisor started"
        );
        self.inner.events.publish(SupervisorEvent::Started {
            generation,
            endpoint: browser.endpoint().to_string(),
        });
        Ok(())
    }

    /// Tear everything down. Never fails; close errors and panics are logged.
    pub async fn stop(&self) {
        if let Some(monitor) = self.inner.monitor.lock().await.take() {
            monitor.abort();
        }

        let (entries, browser) = {
            let mut runtime = self.inner.runtime.write().await;
            self.set_state(BrowserState::Stopped);
            runtime.generation += 1;
            runtime.aliases.clear();
            runtime.orphans.clear();
            let entries: Vec<PageEntry> = runtime.pages.drain().map(|(_, entry)| entry).collect();
            (entries, runtime.browser.take())
        };

        let closed_pages = entries.len();
        self.close_pages(entries).await;
        if let Some(browser) = browser {
            self.close_browser(browser).await;
        }
        self.inner.restarts.lock().await.reset();

        info!(closed_pages, "browser supervisor stopped");
        self.inner.events.publish(SupervisorEvent::Stopped);
    }

    pub async fn process_info(&self) -> ProcessInfo {
        let (generation, endpoint, pid, pages) = {
            let runtime = self.inner.runtime.read().await;
            (
                runtime.generation,
                runtime.browser.as_ref().map(|b| b.endpoint().to_string()),
                runtime.browser.as_ref().and_then(|b| b.pid()),
                runtime.pages.len(),
            )
        };
        let (restart_count, consecutive_restart_failures) = {
            let restarts = self.inner.restarts.lock().await;
            (restarts.count(), restarts.consecutive_failures())
        };
        let since_last_healthy_ms = self
            .inner
            .last_healthy
            .lock()
            .await
            .map(|at| at.elapsed().as_millis() as u64);
        let launch = &self.inner.config.launch;

        ProcessInfo {
            state: self.state(),
            generation,
            endpoint,
            pid,
            restart_count,
            consecutive_restart_failures,
            since_last_healthy_ms,
            pages,
            headless: launch.headless,
            window_width: launch.window_width,
            window_height: launch.window_height,
            slow_motion_ms: launch.slow_motion.as_millis() as u64,
            debug: launch.debug,
        }
    }

    fn set_state(&self, next: BrowserState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "browser state changed");
        }
    }

    /// The live browser, or why there is none
    async fn current_browser(&self) -> Result<Arc<dyn Browser>> {
        self.live_browser().await.map(|(browser, _)| browser)
    }

    /// Park until an in-flight restart has settled
    async fn wait_for_restart(&self) {
        if self.state() == BrowserState::Restarting {
            drop(self.inner.restart_gate.lock().await);
        }
    }

    /// The live browser together with its generation
    async fn live_browser(&self) -> Result<(Arc<dyn Browser>, u64)> {
        self.wait_for_restart().await;
        if self.state() == BrowserState::Failed {
            let failures = self.inner.restarts.lock().await.consecutive_failures();
            return Err(BrowserError::Failed(failures));
        }
        let runtime = self.inner.runtime.read().await;
        match &runtime.browser {
            Some(browser) => Ok((browser.clone(), runtime.generation)),
            None => Err(BrowserError::NotStarted),
        }
    }

    async fn launch(&self) -> Result<Arc<dyn Browser>> {
        let launcher = self.inner.launcher.clone();
        let config = self.inner.config.launch.clone();
        guarded(
            "launch",
            Some(self.inner.config.launch_timeout),
            &self.inner.shutdown,
            async move { launcher.launch(&config).await },
        )
        .await
    }

    /// Make `browser` the live handle; returns its generation
    fn install(&self, runtime: &mut Runtime, browser: Arc<dyn Browser>) -> u64 {
        runtime.generation += 1;
        runtime.browser = Some(browser);
        runtime.generation
    }

    /// Reopen `states` in `browser` at their last URLs. Restored pages get
    /// new ids; the old ids become aliases.
    async fn restore_pages(
        &self,
        runtime: &mut Runtime,
        browser: &Arc<dyn Browser>,
        states: Vec<PageState>,
    ) -> usize {
        let mut restored = 0;
        for state in states {
            let target = browser.clone();
            let url = state.url.clone();
            let opened = guarded(
                "restore_page",
                Some(self.inner.config.operation_timeout),
                &self.inner.shutdown,
                async move { target.new_page(&url).await },
            )
            .await;

            match opened {
                Ok(page) => {
                    let id = PageId::generate();
                    let replacement = state.successor(id.clone(), &self.inner.shutdown);
                    runtime.retire(&state.id, &id);
                    runtime.pages.insert(
                        id.clone(),
                        PageEntry {
                            page,
                            state: replacement,
                        },
                    );
                    debug!(old_page_id = %state.id, page_id = %id, url = %state.url, "page restored");
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        page_id = %state.id,
                        url = %state.url,
                        error = %e,
                        "failed to restore page"
                    );
                    runtime.forget(&state.id);
                }
            }
        }
        restored
    }

    /// Close pages one task each so a panicking driver can't stop the rest
    async fn close_pages(&self, entries: Vec<PageEntry>) {
        for entry in entries {
            entry.state.cancel.cancel();
            let page = entry.page;
            let closed = guarded(
                "close_page",
                Some(self.inner.config.operation_timeout),
                &CancellationToken::new(),
                async move { page.close().await },
            )
            .await;
            if let Err(e) = closed {
                warn!(page_id = %entry.state.id, error = %e, "failed to close page");
            }
        }
    }

    async fn close_browser(&self, browser: Arc<dyn Browser>) {
        let pid = browser.pid();
        let closed = guarded(
            "close_browser",
            Some(self.inner.config.operation_timeout),
            &CancellationToken::new(),
            async move { browser.close().await },
        )
        .await;
        if let Err(e) = closed {
            warn!(pid = ?pid, error = %e, "failed to close browser");
        }
    }
}

/// Run `fut` in its own task, bounded by `limit` and `token`.
///
/// Panics come back as `BrowserError::Panicked`; on timeout or cancellation
/// the task is aborted.
pub(crate) async fn guarded<T, Fut>(
    operation: &'static str,
    limit: Option<Duration>,
    token: &CancellationToken,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    let deadline = async {
        match limit {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = token.cancelled() => {
            handle.abort();
            return Err(BrowserError::Cancelled);
        }
        _ = deadline => {
            handle.abort();
            return Err(BrowserError::Timeout {
                operation,
                after: limit.unwrap_or_default(),
            });
        }
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(BrowserError::Panicked {
            operation,
            message: panic_message(e.into_panic().as_ref()),
        }),
        Err(_) => Err(BrowserError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;

    pub(crate) fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            check_reachability: false,
            ..SupervisorConfig::default()
        }
    }

    pub(crate) fn supervisor() -> (BrowserSupervisor, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new());
        (BrowserSupervisor::new(test_config(), launcher.clone()), launcher)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (supervisor, launcher) = supervisor();
        let mut events = supervisor.subscribe();

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), BrowserState::Running);
        assert!(matches!(events.recv().await.unwrap(), SupervisorEvent::Started { generation: 1, .. }));

        // Second start is a no-op
        supervisor.start().await.unwrap();
        assert_eq!(launcher.launch_count(), 1);

        let info = supervisor.process_info().await;
        assert_eq!(info.pid, Some(4242));
        assert!(info.endpoint.unwrap().starts_with("ws://fake"));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), BrowserState::Stopped);
        assert!(!launcher.browser(0).is_alive());
        assert!(matches!(
            supervisor.new_page("about:blank").await,
            Err(BrowserError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_failure_leaves_stopped() {
        let (supervisor, launcher) = supervisor();
        launcher.fail_next_launches(1);
        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.state(), BrowserState::Stopped);
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), BrowserState::Running);
    }

    #[tokio::test]
    async fn test_stop_completes_despite_panics() {
        let (supervisor, launcher) = supervisor();
        supervisor.start().await.unwrap();
        supervisor.new_page("about:blank").await.unwrap();
        supervisor.new_page("about:blank").await.unwrap();

        launcher.panic_on_close(true);
        supervisor.stop().await;

        assert_eq!(supervisor.state(), BrowserState::Stopped);
        assert!(supervisor.pages().await.is_empty());
        assert_eq!(supervisor.process_info().await.endpoint, None);
    }

    #[tokio::test]
    async fn test_guarded_maps_panics_and_timeouts() {
        let token = CancellationToken::new();
        let panicked = guarded::<(), _>("sample", None, &token, async { panic!("driver exploded") }).await;
        assert!(matches!(
            panicked,
            Err(BrowserError::Panicked { operation: "sample", ref message }) if message == "driver exploded"
        ));

        let timed_out = guarded::<(), _>(
            "sample",
            Some(Duration::from_millis(10)),
            &token,
            std::future::pending(),
        )
        .await;
        assert!(matches!(timed_out, Err(BrowserError::Timeout { operation: "sample", .. })));

        token.cancel();
        let cancelled = guarded::<(), _>("sample", None, &token, std::future::pending()).await;
        assert!(matches!(cancelled, Err(BrowserError::Cancelled)));
    }

    #[test]
    fn test_alias_chains_resolve() {
        let mut runtime = Runtime::default();
        let (a, b, c) = (PageId::from("a"), PageId::from("b"), PageId::from("c"));
        runtime.aliases.insert(a.clone(), b.clone());
        runtime.aliases.insert(b.clone(), c.clone());
        assert_eq!(runtime.resolve(&a), None);

        runtime.pages.insert(
            c.clone(),
            PageEntry {
                page: crate::testing::FakePage::detached("c"),
                state: PageState::new(c.clone(), "about:blank", "", &CancellationToken::new()),
            },
        );
        assert_eq!(runtime.resolve(&a), Some(c.clone()));
        assert_eq!(runtime.resolve(&c), Some(c));
        assert_eq!(runtime.resolve(&PageId::from("zzz")), None);

        // Cycles end instead of spinning
        runtime.aliases.insert(PageId::from("x"), PageId::from("y"));
        runtime.aliases.insert(PageId::from("y"), PageId::from("x"));
        assert_eq!(runtime.resolve(&PageId::from("x")), None);
    }

    #[test]
    fn test_retire_keeps_chains_flat_and_forget_prunes_them() {
        let mut runtime = Runtime::default();
        let (a, b, c) = (PageId::from("a"), PageId::from("b"), PageId::from("c"));
        runtime.retire(&a, &b);
        runtime.retire(&b, &c);
        assert_eq!(runtime.aliases.get(&a), Some(&c));
        assert_eq!(runtime.aliases.get(&b), Some(&c));

        // A chain written without retire is pruned all the same
        runtime.aliases.insert(PageId::from("z"), a.clone());
        runtime.aliases.insert(PageId::from("other"), PageId::from("d"));
        runtime.forget(&c);
        assert_eq!(runtime.aliases.len(), 1);
        assert!(runtime.aliases.contains_key(&PageId::from("other")));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: SupervisorConfig = serde_json::from_str(
            r#"{"operation_timeout": 5000, "launch": {"headless": false}}"#,
        )
        .unwrap();
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert!(!config.launch.headless);
        assert_eq!(config.max_restart_attempts, 5);
    }
}
