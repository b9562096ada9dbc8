//! CDP Session - one attached page target
//!
//! Lightweight wrapper around CDPClient with target-specific context.
//! All sessions share the browser's WebSocket (flattened sessions).

use super::client::{CDPClient, CDPError, Result};
use super::protocol::{
    AttachToTargetResult, EvaluateResult, NavigateResult, ScreenshotResult, SessionId, TargetId,
    TargetInfo,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Domains a supervised page needs; nothing DOM-heavy.
const PAGE_DOMAINS: &[&str] = &["Page", "Runtime"];

/// CDP Session bound to a specific target
#[derive(Clone)]
pub struct CDPSession {
    /// Shared CDP client
    client: Arc<CDPClient>,

    /// Target this session is attached to
    pub target_id: TargetId,

    /// Session ID assigned by Chrome
    pub session_id: SessionId,
}

/// Outcome of a script evaluation inside the page
pub enum Evaluation {
    Value(Value),
    Exception(String),
}

impl CDPSession {
    /// Attach to a target and enable the page domains
    pub async fn attach(client: Arc<CDPClient>, target_id: TargetId) -> Result<Self> {
        let attached: AttachToTargetResult = client
            .call(
                "Target.attachToTarget",
                Some(json!({
                    "targetId": target_id,
                    "flatten": true,
                })),
                None,
            )
            .await?;
        let session_id = attached.session_id;

        let enables = PAGE_DOMAINS.iter().map(|domain| {
            let client = client.clone();
            let session_id = session_id.clone();
            async move {
                client
                    .send_request(format!("{}.enable", domain), None, Some(session_id))
                    .await
            }
        });
        // Page and Runtime are both required
        for result in futures_util::future::join_all(enables).await {
            result?;
        }

        Ok(Self {
            client,
            target_id,
            session_id,
        })
    }

    /// Send command within this session's context
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    /// Current target info (url, title)
    pub async fn target_info(&self) -> Result<TargetInfo> {
        let result = self
            .client
            .send_request(
                "Target.getTargetInfo",
                Some(json!({ "targetId": &self.target_id })),
                None,
            )
            .await?;

        serde_json::from_value(result["targetInfo"].clone()).map_err(CDPError::Json)
    }

    /// Start a navigation. Resolves once the browser committed to it, not on load.
    pub async fn navigate(&self, url: &str) -> Result<NavigateResult> {
        let value = self.send("Page.navigate", Some(json!({ "url": url }))).await?;
        serde_json::from_value(value).map_err(CDPError::Json)
    }

    /// Evaluate an expression, awaiting promises and returning by value
    pub async fn evaluate(&self, expression: &str) -> Result<Evaluation> {
        let value = self
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                })),
            )
            .await?;
        let result: EvaluateResult = serde_json::from_value(value).map_err(CDPError::Json)?;

        Ok(match result.exception_details {
            Some(details) => Evaluation::Exception(details.message()),
            None => Evaluation::Value(result.result.value.unwrap_or(Value::Null)),
        })
    }

    /// PNG screenshot of the viewport, base64 encoded
    pub async fn capture_screenshot(&self) -> Result<String> {
        let value = self
            .send("Page.captureScreenshot", Some(json!({ "format": "png" })))
            .await?;
        let shot: ScreenshotResult = serde_json::from_value(value).map_err(CDPError::Json)?;
        Ok(shot.data)
    }

    /// Close the target (the tab), not just the session
    pub async fn close_target(&self) -> Result<()> {
        self.client
            .send_request(
                "Target.closeTarget",
                Some(json!({ "targetId": &self.target_id })),
                None,
            )
            .await?;
        Ok(())
    }
}
