//! Error types for browser supervision
//!
//! Flat, like the CDP errors underneath. The `Display` texts matter: the
//! retry engine classifies by substring, so transient variants say
//! "timeout", "target closed", "browser not started" and so on.

use std::time::Duration;
use thiserror::Error;

use crate::cdp::CDPError;
use crate::page::PageId;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no usable browser binary found; set CHROME_PATH or install Chrome/Chromium")]
    NoBinary,

    #[error("browser is missing system libraries ({0}); install the browser's shared library dependencies")]
    MissingDependencies(String),

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("browser did not report a DevTools endpoint within {0:?} (startup timeout)")]
    StartupTimeout(Duration),

    #[error("browser exited during startup: {0}")]
    Exited(String),

    #[error("browser bootstrap failed: {0}")]
    Bootstrap(String),
}

impl LaunchError {
    pub fn is_missing_dependencies(&self) -> bool {
        matches!(self, LaunchError::MissingDependencies(_))
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error(transparent)]
    Cdp(#[from] CDPError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("browser not started")]
    NotStarted,

    #[error("browser supervisor failed after {0} consecutive restart failures; restart limit exceeded, operator intervention required")]
    Failed(u32),

    #[error("page not found: {0}")]
    PageNotFound(PageId),

    #[error("target closed: {0}")]
    TargetClosed(String),

    #[error("{operation} timeout after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("url not reachable: {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("browser task panicked during {operation}: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },

    #[error("browser still unhealthy after restart: {0}")]
    Unhealthy(String),
}

impl BrowserError {
    /// Cancellation, deadline and dead-socket errors. These usually mean the
    /// control connection itself is gone, so the browser gets restarted
    /// instead of just the page.
    pub fn is_context_error(&self) -> bool {
        matches!(
            self,
            BrowserError::Cancelled
                | BrowserError::Timeout { .. }
                | BrowserError::Cdp(CDPError::Closed)
                | BrowserError::Cdp(CDPError::Timeout { .. })
                | BrowserError::Cdp(CDPError::WebSocket(_))
        )
    }

    /// Errors caused by what the caller asked for, not by the browser.
    /// These say nothing about browser health.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BrowserError::PageNotFound(_)
                | BrowserError::InvalidUrl(_)
                | BrowserError::Unreachable { .. }
                | BrowserError::Navigation(_)
                | BrowserError::Script(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_errors() {
        assert!(BrowserError::Cancelled.is_context_error());
        assert!(BrowserError::Cdp(CDPError::Closed).is_context_error());
        assert!(BrowserError::Timeout {
            operation: "navigate",
            after: Duration::from_secs(30)
        }
        .is_context_error());
        assert!(!BrowserError::NotStarted.is_context_error());
        assert!(!BrowserError::Script("boom".into()).is_context_error());
    }

    #[test]
    fn test_caller_errors() {
        assert!(BrowserError::InvalidUrl("ftp://x".into()).is_caller_error());
        assert!(BrowserError::PageNotFound(PageId::from("page-1")).is_caller_error());
        assert!(!BrowserError::NotStarted.is_caller_error());
        assert!(!BrowserError::Cdp(CDPError::Closed).is_caller_error());
    }

    #[test]
    fn test_missing_dependencies_is_distinguishable() {
        let err = BrowserError::from(LaunchError::MissingDependencies(
            "libnss3.so: cannot open shared object file".into(),
        ));
        assert!(matches!(&err, BrowserError::Launch(l) if l.is_missing_dependencies()));
        assert!(err.to_string().contains("libnss3"));
    }
}
