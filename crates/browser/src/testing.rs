//! In-memory browser for tests
//!
//! Behaves like a well-mannered Chrome: pages load instantly, scripts echo
//! their source back, screenshots are a fixed PNG header. Each knob below
//! injects one kind of failure.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::cdp::CDPError;
use crate::driver::{Browser, BrowserLauncher, Page, PageInfo};
use crate::error::{BrowserError, LaunchError, Result};
use crate::launcher::LaunchConfig;

const FAKE_PID: u32 = 4242;
const FAKE_PNG: &str = "iVBORw0KGgo=";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Launches [`FakeBrowser`]s and remembers every one
#[derive(Default)]
pub struct FakeLauncher {
    browsers: Mutex<Vec<Arc<FakeBrowser>>>,
    launches: Mutex<Vec<Instant>>,
    failures_left: AtomicU32,
    next_launch_delay: Mutex<Option<Duration>>,
    panic_on_close: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch attempts so far, failed ones included
    pub fn launch_count(&self) -> usize {
        lock(&self.launches).len()
    }

    pub fn launch_times(&self) -> Vec<Instant> {
        lock(&self.launches).clone()
    }

    /// Fail the next `count` launches
    pub fn fail_next_launches(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make the next launch take `delay` before it answers
    pub fn delay_next_launch(&self, delay: Duration) {
        *lock(&self.next_launch_delay) = Some(delay);
    }

    /// Make every page and browser close panic
    pub fn panic_on_close(&self, enabled: bool) {
        self.panic_on_close.store(enabled, Ordering::SeqCst);
    }

    /// The `index`th successfully launched browser
    pub fn browser(&self, index: usize) -> Arc<FakeBrowser> {
        lock(&self.browsers)[index].clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _config: &LaunchConfig) -> Result<Arc<dyn Browser>> {
        lock(&self.launches).push(Instant::now());
        let delay = lock(&self.next_launch_delay).take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::Exited("fake launch failure".to_string()).into());
        }

        let mut browsers = lock(&self.browsers);
        let browser = Arc::new(FakeBrowser::new(browsers.len(), self.panic_on_close.clone()));
        browsers.push(browser.clone());
        Ok(browser)
    }
}

/// Knobs shared between a browser and its pages
struct Shared {
    alive: AtomicBool,
    hang_health: AtomicBool,
    screenshot_failures: AtomicU32,
    panic_on_close: Arc<AtomicBool>,
}

pub struct FakeBrowser {
    endpoint: String,
    shared: Arc<Shared>,
    pages: Mutex<Vec<Arc<FakePage>>>,
    next_target: AtomicUsize,
}

impl FakeBrowser {
    fn new(index: usize, panic_on_close: Arc<AtomicBool>) -> Self {
        Self {
            endpoint: format!("ws://fake/{}", index),
            shared: Arc::new(Shared {
                alive: AtomicBool::new(true),
                hang_health: AtomicBool::new(false),
                screenshot_failures: AtomicU32::new(0),
                panic_on_close,
            }),
            pages: Mutex::new(Vec::new()),
            next_target: AtomicUsize::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Simulate the process dying
    pub fn kill(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }

    /// Make version queries never answer
    pub fn hang_health(&self, enabled: bool) {
        self.shared.hang_health.store(enabled, Ordering::SeqCst);
    }

    pub fn page(&self, index: usize) -> Arc<FakePage> {
        lock(&self.pages)[index].clone()
    }

    /// Pages ever opened in this browser
    pub fn page_count(&self) -> usize {
        lock(&self.pages).len()
    }

    /// Fail the next `count` screenshots as if the socket had dropped
    pub fn fail_screenshots_with_closed_socket(&self, count: u32) {
        self.shared.screenshot_failures.store(count, Ordering::SeqCst);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BrowserError::Cdp(CDPError::Closed))
        }
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn pid(&self) -> Option<u32> {
        Some(FAKE_PID)
    }

    async fn is_running(&self) -> bool {
        self.is_alive()
    }

    async fn version(&self) -> Result<String> {
        self.ensure_alive()?;
        if self.shared.hang_health.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok("FakeChrome/1.0".to_string())
    }

    async fn new_page(&self, url: &str) -> Result<Arc<dyn Page>> {
        self.ensure_alive()?;
        let target = format!("target-{}", self.next_target.fetch_add(1, Ordering::SeqCst));
        let page = Arc::new(FakePage::new(target, url, Some(self.shared.clone())));
        lock(&self.pages).push(page.clone());
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        if self.shared.panic_on_close.load(Ordering::SeqCst) {
            panic!("fake browser close panicked");
        }
        self.kill();
        Ok(())
    }
}

pub struct FakePage {
    target_id: String,
    info: Mutex<PageInfo>,
    broken: AtomicBool,
    closed: AtomicBool,
    browser: Option<Arc<Shared>>,
}

impl FakePage {
    fn new(target_id: String, url: &str, browser: Option<Arc<Shared>>) -> Self {
        Self {
            target_id,
            info: Mutex::new(PageInfo {
                url: url.to_string(),
                title: format!("Title of {}", url),
            }),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            browser,
        }
    }

    /// A page that belongs to no browser
    pub fn detached(target_id: &str) -> Arc<FakePage> {
        Arc::new(Self::new(target_id.to_string(), "about:blank", None))
    }

    /// Make every later call fail as if the renderer crashed
    pub fn break_page(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> String {
        lock(&self.info).url.clone()
    }

    fn ensure_usable(&self) -> Result<()> {
        if let Some(browser) = &self.browser {
            if !browser.alive.load(Ordering::SeqCst) {
                return Err(BrowserError::Cdp(CDPError::Closed));
            }
        }
        if self.broken.load(Ordering::SeqCst) || self.is_closed() {
            return Err(BrowserError::TargetClosed(self.target_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Page for FakePage {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.ensure_usable()?;
        *lock(&self.info) = PageInfo {
            url: url.to_string(),
            title: format!("Title of {}", url),
        };
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_usable()?;
        Ok(Value::String(expression.to_string()))
    }

    async fn screenshot(&self) -> Result<String> {
        self.ensure_usable()?;
        if let Some(browser) = &self.browser {
            let dropped = browser
                .screenshot_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if dropped {
                return Err(BrowserError::Cdp(CDPError::Closed));
            }
        }
        Ok(FAKE_PNG.to_string())
    }

    async fn info(&self) -> Result<PageInfo> {
        self.ensure_usable()?;
        Ok(lock(&self.info).clone())
    }

    async fn close(&self) -> Result<()> {
        if let Some(browser) = &self.browser {
            if browser.panic_on_close.load(Ordering::SeqCst) {
                panic!("fake page close panicked");
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
