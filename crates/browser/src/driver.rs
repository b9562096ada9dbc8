//! Driver traits - the seam between supervision and the browser itself
//!
//! The supervisor only ever talks to these traits. The Chrome implementation
//! lives in [`crate::chrome`]; tests plug in an in-memory one.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::launcher::LaunchConfig;

/// Starts browser processes
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a browser and connect to its control endpoint
    async fn launch(&self, config: &LaunchConfig) -> Result<Arc<dyn Browser>>;
}

/// One running browser process plus its control connection
#[async_trait]
pub trait Browser: Send + Sync {
    /// Control endpoint address (CDP WebSocket URL)
    fn endpoint(&self) -> &str;

    /// Process id, when known. Advisory only.
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still alive
    async fn is_running(&self) -> bool;

    /// Cheap round trip over the control endpoint; returns the product string
    async fn version(&self) -> Result<String>;

    async fn new_page(&self, url: &str) -> Result<Arc<dyn Page>>;

    /// Close the control connection and the process
    async fn close(&self) -> Result<()>;
}

/// One tab
#[async_trait]
pub trait Page: Send + Sync {
    fn target_id(&self) -> &str;

    /// Navigate and wait for the document to finish loading
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Evaluate a JavaScript expression, awaiting promises
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    /// PNG of the viewport, base64 encoded
    async fn screenshot(&self) -> Result<String>;

    async fn info(&self) -> Result<PageInfo>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}
