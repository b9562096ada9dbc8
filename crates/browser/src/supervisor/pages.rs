//! Page operations
//!
//! Every operation follows the same path: resolve aliases, probe the page
//! (recovering it if the probe fails), run the driver call in its own task
//! under the operation timeout and the page's token, then record timing.
//! A cancellation/timeout/dead-socket failure restarts the browser and the
//! operation is retried once against the restored page.

use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use resilience::CancellationToken;

use super::{guarded, BrowserSupervisor, PageEntry};
use crate::driver::{Page, PageInfo};
use crate::error::{BrowserError, Result};
use crate::events::SupervisorEvent;
use crate::page::{PageId, PageSnapshot, PageState, Screenshot, ScriptOutcome};
use crate::script::wrap_script;

/// Cheap round trip proving the page's renderer still answers
const PROBE_SCRIPT: &str = "1";

fn log_outcome<T>(operation: &'static str, page_id: Option<&PageId>, started: Instant, result: &Result<T>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let page_id = page_id.map(PageId::as_str).unwrap_or("-");
    match result {
        Ok(_) => info!(operation, page_id, elapsed_ms, "browser operation completed"),
        Err(e) => warn!(operation, page_id, elapsed_ms, error = %e, "browser operation failed"),
    }
}

impl BrowserSupervisor {
    pub async fn new_page(&self, url: &str) -> Result<PageSnapshot> {
        let started = Instant::now();
        let result = self.new_page_inner(url).await;
        log_outcome("new_page", result.as_ref().ok().map(|p| &p.page_id), started, &result);
        result
    }

    pub async fn navigate(&self, id: &PageId, url: &str) -> Result<PageSnapshot> {
        let started = Instant::now();
        let result = self.navigate_inner(id, url).await;
        log_outcome("navigate", Some(id), started, &result);
        result
    }

    pub async fn screenshot(&self, id: &PageId) -> Result<Screenshot> {
        let started = Instant::now();
        let result = self.screenshot_inner(id).await;
        log_outcome("screenshot", Some(id), started, &result);
        result
    }

    /// Evaluate caller-supplied script text; see [`crate::script`] for how
    /// it is wrapped.
    pub async fn execute_script(&self, id: &PageId, script: &str) -> Result<ScriptOutcome> {
        let started = Instant::now();
        let result = self.execute_script_inner(id, script).await;
        log_outcome("execute_script", Some(id), started, &result);
        result
    }

    pub async fn close_page(&self, id: &PageId) -> Result<()> {
        self.wait_for_restart().await;
        let entry = {
            let mut runtime = self.inner.runtime.write().await;
            let current = runtime
                .resolve(id)
                .ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;
            runtime.forget(&current);
            runtime.pages.remove(&current)
        };
        let entry = entry.ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;

        entry.state.cancel.cancel();
        let page_id = entry.state.id.clone();
        let page = entry.page;
        guarded(
            "close_page",
            Some(self.inner.config.operation_timeout),
            &CancellationToken::new(),
            async move { page.close().await },
        )
        .await?;

        debug!(page_id = %page_id, "page closed");
        self.inner
            .events
            .publish(SupervisorEvent::PageClosed { page_id });
        Ok(())
    }

    /// Tracked pages, oldest first
    pub async fn pages(&self) -> Vec<PageSnapshot> {
        let runtime = self.inner.runtime.read().await;
        let mut pages: Vec<PageSnapshot> = runtime
            .pages
            .values()
            .map(|entry| entry.state.snapshot())
            .collect();
        pages.sort_by(|a, b| a.page_id.cmp(&b.page_id));
        pages
    }

    /// The live id for `id`, following recovery aliases
    pub async fn resolve(&self, id: &PageId) -> Option<PageId> {
        self.wait_for_restart().await;
        self.inner.runtime.read().await.resolve(id)
    }

    /// Replace a page with a fresh one at its last URL. The old id keeps
    /// resolving to the new page.
    pub async fn recover_page(&self, id: &PageId) -> Result<PageId> {
        let started = Instant::now();
        let result = self.recover_page_inner(id).await;
        log_outcome("recover_page", Some(id), started, &result);
        result
    }

    async fn new_page_inner(&self, url: &str) -> Result<PageSnapshot> {
        self.check_destination(url).await?;
        match self.open_page(url).await {
            Err(e) if self.should_restart(&e) => {
                warn!(operation = "new_page", error = %e, "control connection lost, restarting browser");
                self.restart_browser().await?;
                self.open_page(url).await
            }
            other => other,
        }
    }

    async fn open_page(&self, url: &str) -> Result<PageSnapshot> {
        let (browser, generation) = self.live_browser().await?;
        let address = url.to_string();
        let (page, info) = guarded(
            "new_page",
            Some(self.inner.config.operation_timeout),
            &self.inner.shutdown,
            async move {
                let page = browser.new_page(&address).await?;
                let info = match page.info().await {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(error = %e, "page info unavailable, keeping requested url");
                        PageInfo {
                            url: address,
                            title: String::new(),
                        }
                    }
                };
                Ok((page, info))
            },
        )
        .await?;

        let id = PageId::generate();
        let state = PageState::new(id.clone(), info.url, info.title, &self.inner.shutdown);
        let snapshot = state.snapshot();

        {
            let mut runtime = self.inner.runtime.write().await;
            if runtime.generation == generation {
                runtime.pages.insert(id.clone(), PageEntry { page, state });
                drop(runtime);
                self.inner.events.publish(SupervisorEvent::PageOpened {
                    page_id: id,
                    url: snapshot.url.clone(),
                });
                return Ok(snapshot);
            }
        }

        // The browser was replaced while the page was opening
        let _ = guarded(
            "close_page",
            Some(self.inner.config.page_probe_timeout),
            &CancellationToken::new(),
            async move { page.close().await },
        )
        .await;
        Err(BrowserError::TargetClosed(
            "browser was replaced while the page was opening".to_string(),
        ))
    }

    async fn navigate_inner(&self, id: &PageId, url: &str) -> Result<PageSnapshot> {
        self.check_destination(url).await?;
        let address = url.to_string();
        let (current, info) = self
            .run_on_page("navigate", id, move |page| {
                let address = address.clone();
                async move {
                    page.navigate(&address).await?;
                    let info = page.info().await?;
                    Ok(PageInfo {
                        url: if info.url.is_empty() { address } else { info.url },
                        title: info.title,
                    })
                }
            })
            .await?;

        self.update_page(&current, |state| {
            state.url = info.url;
            state.title = info.title;
        })
        .await
        .ok_or(BrowserError::PageNotFound(current))
    }

    async fn screenshot_inner(&self, id: &PageId) -> Result<Screenshot> {
        self.check_tracked_destination(id).await?;
        let (page_id, data) = self
            .run_on_page("screenshot", id, |page| async move { page.screenshot().await })
            .await?;
        Ok(Screenshot {
            page_id,
            data,
            mime_type: "image/png",
        })
    }

    async fn execute_script_inner(&self, id: &PageId, script: &str) -> Result<ScriptOutcome> {
        self.check_tracked_destination(id).await?;
        let expression = wrap_script(script);
        let (page_id, value) = self
            .run_on_page("execute_script", id, move |page| {
                let expression = expression.clone();
                async move { page.evaluate(&expression).await }
            })
            .await?;
        Ok(ScriptOutcome { page_id, value })
    }

    fn should_restart(&self, error: &BrowserError) -> bool {
        error.is_context_error() && !self.inner.shutdown.is_cancelled()
    }

    /// Run `op` against the page, restarting the browser and retrying once
    /// on a context error. Returns the id the page ended up under.
    async fn run_on_page<T, F, Fut>(&self, operation: &'static str, id: &PageId, op: F) -> Result<(PageId, T)>
    where
        F: Fn(Arc<dyn Page>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let outcome = match self.attempt_on_page(operation, id, &op).await {
            Err(e) if self.should_restart(&e) => {
                warn!(operation, page_id = %id, error = %e, "control connection lost, restarting browser");
                self.restart_browser().await?;
                self.attempt_on_page(operation, id, &op).await
            }
            other => other,
        };

        if let Ok((current, _)) = &outcome {
            self.update_page(current, PageState::touch).await;
        }
        outcome
    }

    async fn attempt_on_page<T, F, Fut>(&self, operation: &'static str, id: &PageId, op: &F) -> Result<(PageId, T)>
    where
        F: Fn(Arc<dyn Page>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let probed = self.ensure_page_healthy(id).await?;

        // Held for the whole call so recovery can't swap the page underneath
        let runtime = self.inner.runtime.read().await;
        let entry = runtime
            .resolve(&probed)
            .and_then(|current| runtime.pages.get(&current))
            .ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;
        let current = entry.state.id.clone();
        let result = guarded(
            operation,
            Some(self.inner.config.operation_timeout),
            &entry.state.cancel,
            op(entry.page.clone()),
        )
        .await;
        drop(runtime);

        result.map(|value| (current, value))
    }

    /// Probe the page and recover it when the probe fails. Returns the id
    /// to use for the operation.
    async fn ensure_page_healthy(&self, id: &PageId) -> Result<PageId> {
        self.wait_for_restart().await;
        let (current, page, token) = {
            let runtime = self.inner.runtime.read().await;
            let entry = runtime
                .resolve(id)
                .and_then(|current| runtime.pages.get(&current))
                .ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;
            (entry.state.id.clone(), entry.page.clone(), entry.state.cancel.clone())
        };

        let probe = guarded(
            "page_probe",
            Some(self.inner.config.page_probe_timeout),
            &token,
            async move { page.evaluate(PROBE_SCRIPT).await },
        )
        .await;

        match probe {
            Ok(_) => Ok(current),
            Err(e) => {
                warn!(page_id = %current, error = %e, "page probe failed, recovering page");
                self.recover_page(&current).await
            }
        }
    }

    async fn recover_page_inner(&self, id: &PageId) -> Result<PageId> {
        self.wait_for_restart().await;
        let mut runtime = self.inner.runtime.write().await;
        let current = runtime
            .resolve(id)
            .ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;
        let browser = runtime.browser.clone().ok_or(BrowserError::NotStarted)?;
        let old = runtime
            .pages
            .remove(&current)
            .ok_or_else(|| BrowserError::PageNotFound(id.clone()))?;

        old.state.cancel.cancel();
        let stale = old.page.clone();
        if let Err(e) = guarded(
            "close_page",
            Some(self.inner.config.page_probe_timeout),
            &CancellationToken::new(),
            async move { stale.close().await },
        )
        .await
        {
            debug!(page_id = %current, error = %e, "closing unhealthy page failed");
        }

        let url = old.state.url.clone();
        let opened = guarded(
            "recover_page",
            Some(self.inner.config.operation_timeout),
            &self.inner.shutdown,
            async move { browser.new_page(&url).await },
        )
        .await;

        match opened {
            Ok(page) => {
                let replacement_id = PageId::generate();
                let state = old.state.successor(replacement_id.clone(), &self.inner.shutdown);
                let recovery_count = state.recovery_count;
                runtime.retire(&current, &replacement_id);
                runtime
                    .pages
                    .insert(replacement_id.clone(), PageEntry { page, state });
                drop(runtime);

                info!(
                    old_page_id = %current,
                    page_id = %replacement_id,
                    recovery_count,
                    "page recovered"
                );
                self.inner.events.publish(SupervisorEvent::PageRecovered {
                    old_page_id: current,
                    page_id: replacement_id.clone(),
                    recovery_count,
                });
                Ok(replacement_id)
            }
            Err(e) => {
                // Keep the page tracked so a later attempt can try again
                let mut state = old.state;
                state.healthy = false;
                state.cancel = self.inner.shutdown.child_token();
                runtime.pages.insert(
                    current,
                    PageEntry {
                        page: old.page,
                        state,
                    },
                );
                Err(e)
            }
        }
    }

    async fn update_page(&self, id: &PageId, update: impl FnOnce(&mut PageState)) -> Option<PageSnapshot> {
        let mut runtime = self.inner.runtime.write().await;
        let entry = runtime.pages.get_mut(id)?;
        update(&mut entry.state);
        entry.state.touch();
        Some(entry.state.snapshot())
    }

    async fn check_destination(&self, url: &str) -> Result<()> {
        self.inner
            .reachability
            .check(url, &self.inner.shutdown)
            .await
    }

    /// Re-check the page's current http(s) URL; other schemes pass
    async fn check_tracked_destination(&self, id: &PageId) -> Result<()> {
        let url = {
            let runtime = self.inner.runtime.read().await;
            runtime
                .resolve(id)
                .and_then(|current| runtime.pages.get(&current))
                .map(|entry| entry.state.url.clone())
        };
        match url {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                self.check_destination(&url).await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::tests::{supervisor, test_config};
    use crate::supervisor::BrowserState;
    use crate::testing::FakeLauncher;

    #[tokio::test]
    async fn test_page_operations() {
        let (supervisor, _launcher) = supervisor();
        supervisor.start().await.unwrap();

        let page = supervisor.new_page("about:blank").await.unwrap();
        assert_eq!(page.url, "about:blank");
        assert_eq!(page.recovery_count, 0);

        let navigated = supervisor
            .navigate(&page.page_id, "https://example.com/docs")
            .await
            .unwrap();
        assert_eq!(navigated.url, "https://example.com/docs");
        assert_eq!(navigated.title, "Title of https://example.com/docs");

        let outcome = supervisor
            .execute_script(&page.page_id, "document.title")
            .await
            .unwrap();
        assert_eq!(outcome.page_id, page.page_id);
        assert_eq!(
            outcome.value,
            serde_json::json!("(async () => {\nreturn (document.title);\n})()")
        );

        let shot = supervisor.screenshot(&page.page_id).await.unwrap();
        assert_eq!(shot.mime_type, "image/png");
        assert!(!shot.data.is_empty());

        assert_eq!(supervisor.pages().await.len(), 1);
        supervisor.close_page(&page.page_id).await.unwrap();
        assert!(supervisor.pages().await.is_empty());
        assert!(matches!(
            supervisor.screenshot(&page.page_id).await,
            Err(BrowserError::PageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unresponsive_page_recovered_at_same_url() {
        let (supervisor, launcher) = supervisor();
        supervisor.start().await.unwrap();
        let page = supervisor.new_page("https://example.com/u").await.unwrap();
        let mut events = supervisor.subscribe();

        launcher.browser(0).page(0).break_page();
        let outcome = supervisor
            .execute_script(&page.page_id, "1 + 1")
            .await
            .unwrap();

        assert_ne!(outcome.page_id, page.page_id);
        let pages = supervisor.pages().await;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].url, "https://example.com/u");
        assert_eq!(pages[0].recovery_count, 1);
        assert_eq!(supervisor.resolve(&page.page_id).await, Some(outcome.page_id.clone()));
        assert!(launcher.browser(0).page(0).is_closed());
        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisorEvent::PageRecovered { recovery_count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_recovery_count_only_grows() {
        let (supervisor, _launcher) = supervisor();
        supervisor.start().await.unwrap();
        let first = supervisor.new_page("https://example.com/").await.unwrap();

        let second = supervisor.recover_page(&first.page_id).await.unwrap();
        // Recovering through the retired id reaches the live page
        let third = supervisor.recover_page(&first.page_id).await.unwrap();

        assert_ne!(second, third);
        let pages = supervisor.pages().await;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_id, third);
        assert_eq!(pages[0].recovery_count, 2);
        assert_eq!(supervisor.resolve(&second).await, Some(third));
    }

    #[tokio::test]
    async fn test_close_through_retired_id_drops_whole_alias_chain() {
        let (supervisor, _launcher) = supervisor();
        supervisor.start().await.unwrap();
        let first = supervisor.new_page("https://example.com/").await.unwrap();
        let second = supervisor.recover_page(&first.page_id).await.unwrap();
        let third = supervisor.recover_page(&second).await.unwrap();
        supervisor.restart_browser().await.unwrap();
        let live = supervisor.resolve(&first.page_id).await.unwrap();
        assert_ne!(live, third);

        supervisor.close_page(&first.page_id).await.unwrap();

        assert!(supervisor.inner.runtime.read().await.aliases.is_empty());
        for id in [&first.page_id, &second, &third, &live] {
            assert_eq!(supervisor.resolve(id).await, None);
        }
    }

    #[tokio::test]
    async fn test_context_error_restarts_and_retries_once() {
        let (supervisor, launcher) = supervisor();
        supervisor.start().await.unwrap();
        let page = supervisor.new_page("https://example.com/").await.unwrap();

        launcher.browser(0).fail_screenshots_with_closed_socket(1);
        let shot = supervisor.screenshot(&page.page_id).await.unwrap();

        assert_eq!(launcher.launch_count(), 2);
        assert_ne!(shot.page_id, page.page_id);
        assert_eq!(supervisor.state(), BrowserState::Running);
        assert_eq!(supervisor.pages().await[0].url, "https://example.com/");
    }

    #[tokio::test]
    async fn test_no_restart_during_shutdown() {
        let launcher = Arc::new(FakeLauncher::new());
        let shutdown = CancellationToken::new();
        let supervisor = BrowserSupervisor::with_dependencies(
            test_config(),
            launcher.clone(),
            Arc::new(resilience::CircuitBreaker::new(
                resilience::CircuitBreakerConfig::network(),
            )),
            shutdown.clone(),
        );
        supervisor.start().await.unwrap();
        let page = supervisor.new_page("about:blank").await.unwrap();

        shutdown.cancel();
        assert!(supervisor.screenshot(&page.page_id).await.is_err());
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_destination_rejected_before_opening() {
        let launcher = Arc::new(FakeLauncher::new());
        let supervisor = BrowserSupervisor::new(Default::default(), launcher.clone());
        supervisor.start().await.unwrap();

        assert!(matches!(
            supervisor.new_page("ftp://example.com/").await,
            Err(BrowserError::InvalidUrl(_))
        ));
        assert_eq!(launcher.browser(0).page_count(), 0);
        supervisor.stop().await;
    }
}
