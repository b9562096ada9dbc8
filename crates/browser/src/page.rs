//! Page bookkeeping - ids and per-page state tracked by the supervisor

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

use resilience::CancellationToken;

/// Opaque page key handed to clients.
///
/// Built from a UUIDv7, so ids sort by creation time and never repeat
/// within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    pub fn generate() -> Self {
        Self(format!("page-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What the supervisor remembers about one page.
///
/// Replaced wholesale on recovery; the cancellation token goes with it.
#[derive(Debug, Clone)]
pub struct PageState {
    pub id: PageId,
    pub url: String,
    pub title: String,
    pub healthy: bool,
    pub last_active: Instant,
    pub recovery_count: u32,
    pub cancel: CancellationToken,
}

impl PageState {
    pub fn new(id: PageId, url: impl Into<String>, title: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            id,
            url: url.into(),
            title: title.into(),
            healthy: true,
            last_active: Instant::now(),
            recovery_count: 0,
            cancel: parent.child_token(),
        }
    }

    /// State for the page that replaces this one
    pub fn successor(&self, id: PageId, parent: &CancellationToken) -> Self {
        Self {
            id,
            url: self.url.clone(),
            title: self.title.clone(),
            healthy: true,
            last_active: Instant::now(),
            recovery_count: self.recovery_count + 1,
            cancel: parent.child_token(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            page_id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            healthy: self.healthy,
            recovery_count: self.recovery_count,
            idle_ms: self.last_active.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable view of a tracked page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSnapshot {
    pub page_id: PageId,
    pub url: String,
    pub title: String,
    pub healthy: bool,
    pub recovery_count: u32,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub page_id: PageId,
    /// base64 PNG
    pub data: String,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptOutcome {
    pub page_id: PageId,
    pub value: serde_json::Value,
}
