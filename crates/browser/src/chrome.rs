//! Chrome driver - `BrowserLauncher`/`Browser`/`Page` over CDP
//!
//! One WebSocket per browser, one flattened CDP session per page. Crashed
//! or destroyed targets are recorded from Target events so page calls fail
//! fast with `TargetClosed` instead of waiting out a request timeout.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cdp::protocol::{BrowserVersion, CreateTargetResult};
use crate::cdp::{CDPClient, CDPEvent, CDPSession, ClientOptions, Evaluation, TargetId};
use crate::driver::{Browser, BrowserLauncher, Page, PageInfo};
use crate::error::{BrowserError, Result};
use crate::launcher::{start_browser, BrowserFetcher, BrowserProcess, LaunchConfig, SystemBinaries};

const READY_STATE_POLL: Duration = Duration::from_millis(100);

/// Target ids the browser reported as gone, with the reason
type ClosedTargets = Arc<DashMap<TargetId, &'static str>>;

/// Launches local Chromium-family browsers
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    binaries: SystemBinaries,
}

impl ChromeLauncher {
    pub fn new(fetcher: BrowserFetcher) -> Self {
        Self {
            binaries: SystemBinaries::new(fetcher),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, config: &LaunchConfig) -> Result<Arc<dyn Browser>> {
        let process = start_browser(&self.binaries, config).await?;
        let browser = ChromeBrowser::connect(process, config).await?;
        Ok(Arc::new(browser))
    }
}

/// A running Chrome plus its CDP connection
pub struct ChromeBrowser {
    client: Arc<CDPClient>,
    process: BrowserProcess,
    closed_targets: ClosedTargets,
    slow_motion: Duration,
    load_timeout: Duration,
}

impl ChromeBrowser {
    /// Connect to an already spawned process. The process is terminated if
    /// the connection cannot be set up.
    pub async fn connect(process: BrowserProcess, config: &LaunchConfig) -> Result<Self> {
        let options = ClientOptions {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            trace_traffic: config.debug,
        };

        let client = match CDPClient::connect(process.ws_url(), options).await {
            Ok(client) => client,
            Err(e) => {
                process.terminate().await;
                return Err(e.into());
            }
        };

        let closed_targets: ClosedTargets = Arc::new(DashMap::new());
        for (method, reason) in [
            ("Target.targetCrashed", "crashed"),
            ("Target.targetDestroyed", "destroyed"),
        ] {
            let closed = closed_targets.clone();
            client.subscribe(
                method,
                Arc::new(move |event: CDPEvent| {
                    if let Some(target_id) = event
                        .params
                        .as_ref()
                        .and_then(|p| p.get("targetId"))
                        .and_then(Value::as_str)
                    {
                        closed.insert(target_id.to_string(), reason);
                    }
                }),
            );
        }

        if let Err(e) = client
            .send_request("Target.setDiscoverTargets", Some(json!({ "discover": true })), None)
            .await
        {
            let _ = client.close().await;
            process.terminate().await;
            return Err(e.into());
        }

        info!(pid = ?process.pid(), endpoint = %process.ws_url(), "connected to browser");

        Ok(Self {
            client,
            process,
            closed_targets,
            slow_motion: config.slow_motion,
            load_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    fn endpoint(&self) -> &str {
        self.process.ws_url()
    }

    fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    async fn is_running(&self) -> bool {
        self.process.is_running().await
    }

    async fn version(&self) -> Result<String> {
        let version: BrowserVersion = self.client.call("Browser.getVersion", None, None).await?;
        Ok(version.product)
    }

    async fn new_page(&self, url: &str) -> Result<Arc<dyn Page>> {
        let created: CreateTargetResult = self
            .client
            .call("Target.createTarget", Some(json!({ "url": url })), None)
            .await?;
        let target_id = created.target_id;

        let session = match CDPSession::attach(self.client.clone(), target_id.clone()).await {
            Ok(session) => session,
            Err(e) => {
                // Don't leak a tab we can't drive
                let _ = self
                    .client
                    .send_request("Target.closeTarget", Some(json!({ "targetId": target_id })), None)
                    .await;
                return Err(e.into());
            }
        };

        let page = ChromePage {
            session,
            closed_targets: self.closed_targets.clone(),
            slow_motion: self.slow_motion,
            load_timeout: self.load_timeout,
        };
        page.wait_for_load().await?;
        debug!(target_id = %page.session.target_id, url, "page created");
        Ok(Arc::new(page))
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.client.send_request("Browser.close", None, None).await {
            debug!("Browser.close failed: {}", e);
        }
        if let Err(e) = self.client.close().await {
            debug!("CDP close failed: {}", e);
        }
        self.process.terminate().await;
        info!(pid = ?self.process.pid(), "browser closed");
        Ok(())
    }
}

/// One tab driven through its own CDP session
pub struct ChromePage {
    session: CDPSession,
    closed_targets: ClosedTargets,
    slow_motion: Duration,
    load_timeout: Duration,
}

impl ChromePage {
    fn ensure_open(&self) -> Result<()> {
        match self.closed_targets.get(&self.session.target_id) {
            Some(reason) => Err(BrowserError::TargetClosed(format!(
                "{} {}",
                self.session.target_id,
                reason.value()
            ))),
            None => Ok(()),
        }
    }

    async fn pace(&self) {
        if !self.slow_motion.is_zero() {
            tokio::time::sleep(self.slow_motion).await;
        }
    }

    /// Poll `document.readyState` until the document finished loading
    async fn wait_for_load(&self) -> Result<()> {
        let poll = async {
            loop {
                self.ensure_open()?;
                if let Evaluation::Value(Value::String(state)) =
                    self.session.evaluate("document.readyState").await?
                {
                    if state == "complete" {
                        return Ok::<(), BrowserError>(());
                    }
                }
                tokio::time::sleep(READY_STATE_POLL).await;
            }
        };
        tokio::time::timeout(self.load_timeout, poll)
            .await
            .map_err(|_| BrowserError::Timeout {
                operation: "page load",
                after: self.load_timeout,
            })?
    }
}

#[async_trait]
impl Page for ChromePage {
    fn target_id(&self) -> &str {
        &self.session.target_id
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        self.pace().await;
        let result = self.session.navigate(url).await?;
        if let Some(text) = result.error_text.filter(|t| !t.is_empty()) {
            return Err(BrowserError::Navigation(format!("{}: {}", url, text)));
        }
        self.wait_for_load().await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_open()?;
        self.pace().await;
        match self.session.evaluate(expression).await? {
            Evaluation::Value(value) => Ok(value),
            Evaluation::Exception(message) => Err(BrowserError::Script(message)),
        }
    }

    async fn screenshot(&self) -> Result<String> {
        self.ensure_open()?;
        self.pace().await;
        Ok(self.session.capture_screenshot().await?)
    }

    async fn info(&self) -> Result<PageInfo> {
        self.ensure_open()?;
        let info = self.session.target_info().await?;
        Ok(PageInfo {
            url: info.url,
            title: info.title,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.ensure_open().is_err() {
            return Ok(());
        }
        self.session.close_target().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{BrowserSupervisor, SupervisorConfig};

    #[tokio::test]
    #[ignore] // Requires Chrome
    async fn test_launch_open_and_evaluate() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let launcher = Arc::new(ChromeLauncher::default());
        let config = SupervisorConfig {
            check_reachability: false,
            ..SupervisorConfig::default()
        };
        let supervisor = BrowserSupervisor::new(config, launcher);
        supervisor.start().await.unwrap();

        let page = supervisor.new_page("about:blank").await.unwrap();
        let outcome = supervisor
            .execute_script(&page.page_id, "1 + 1")
            .await
            .unwrap();
        assert_eq!(outcome.value, json!(2));

        let shot = supervisor.screenshot(&page.page_id).await.unwrap();
        assert!(!shot.data.is_empty());

        supervisor.stop().await;
    }
}
