//! Browser tools - thin adapters from tool calls to supervisor operations
//!
//! Every call runs through the `tool` retry preset and the browser circuit
//! breaker. Errors caused by the request itself (unknown page, bad URL,
//! script exceptions) pass through the breaker as successes so a careless
//! client can't trip it.

use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use browser::{BrowserError, BrowserSupervisor, PageId};
use resilience::{CancellationToken, CircuitBreakers, CircuitError, RetryEngine, RetryError, RetryPolicy};

use crate::error::{Result, ToolError};
use crate::registry::ToolRegistry;
use crate::schema::{PropertySchema, ToolSchema};
use crate::tool::{Content, Tool, ToolArguments, ToolResponse};

const DEFAULT_URL: &str = "about:blank";

/// What every browser tool shares
pub struct BrowserToolContext {
    supervisor: BrowserSupervisor,
    breakers: CircuitBreakers,
    retry: RetryEngine,
    shutdown: CancellationToken,
}

impl BrowserToolContext {
    pub fn new(supervisor: BrowserSupervisor, breakers: CircuitBreakers, shutdown: CancellationToken) -> Self {
        Self {
            supervisor,
            breakers,
            retry: RetryEngine::new(RetryPolicy::tool()),
            shutdown,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryEngine::new(policy);
        self
    }

    pub fn supervisor(&self) -> &BrowserSupervisor {
        &self.supervisor
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = browser::Result<T>>,
    {
        let breaker = &self.breakers.browser;
        let call = &call;
        let outcome = self
            .retry
            .execute_with_result(&self.shutdown, || async move {
                breaker
                    .call(|| async move {
                        match call().await {
                            Err(e) if e.is_caller_error() => Ok(Err(e)),
                            other => other.map(Ok),
                        }
                    })
                    .await
            })
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ToolError::Browser(e)),
            Err(RetryError::Cancelled) => Err(ToolError::Cancelled),
            Err(RetryError::Fatal(e)) => Err(from_circuit(e)),
            Err(RetryError::Exhausted { attempts, last }) => {
                debug!(operation, attempts, "browser tool gave up");
                Err(from_circuit(last))
            }
        }
    }
}

fn from_circuit(error: CircuitError<BrowserError>) -> ToolError {
    match error {
        CircuitError::Inner(e) => ToolError::Browser(e),
        rejected => ToolError::Unavailable(rejected.to_string()),
    }
}

fn page_id_property() -> PropertySchema {
    PropertySchema::string("Page id returned by browser_new_page or browser_list_pages")
}

/// Register every browser tool against one shared context
pub fn register_browser_tools(registry: &mut ToolRegistry, context: Arc<BrowserToolContext>) -> Result<()> {
    registry.register(Arc::new(NewPageTool(context.clone())))?;
    registry.register(Arc::new(NavigateTool(context.clone())))?;
    registry.register(Arc::new(ScreenshotTool(context.clone())))?;
    registry.register(Arc::new(EvaluateTool(context.clone())))?;
    registry.register(Arc::new(ListPagesTool(context.clone())))?;
    registry.register(Arc::new(ClosePageTool(context.clone())))?;
    registry.register(Arc::new(HealthTool(context)))?;
    Ok(())
}

pub struct NewPageTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for NewPageTool {
    fn name(&self) -> &str {
        "browser_new_page"
    }

    fn description(&self) -> &str {
        "Open a new browser page, optionally at a URL"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object().property(
            "url",
            PropertySchema::string("Initial URL").with_default(DEFAULT_URL),
        )
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<ToolResponse> {
        let url = arguments.get_str("url").unwrap_or(DEFAULT_URL);
        let supervisor = self.0.supervisor();
        let page = self.0.run("new_page", || supervisor.new_page(url)).await?;
        ToolResponse::json(&page)
    }
}

pub struct NavigateTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for NavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    fn description(&self) -> &str {
        "Navigate a page to a URL and wait for it to load"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
            .required_property("page_id", page_id_property())
            .required_property("url", PropertySchema::string("Destination URL"))
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<ToolResponse> {
        let page_id = PageId::from(arguments.require_str("page_id")?);
        let url = arguments.require_str("url")?;
        let supervisor = self.0.supervisor();
        let page = self
            .0
            .run("navigate", || supervisor.navigate(&page_id, url))
            .await?;
        ToolResponse::json(&page)
    }
}

pub struct ScreenshotTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for ScreenshotTool {
    fn name(&self) -> &str {
        "browser_screenshot"
    }

    fn description(&self) -> &str {
        "Capture the visible part of a page as a PNG"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object().required_property("page_id", page_id_property())
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<ToolResponse> {
        let page_id = PageId::from(arguments.require_str("page_id")?);
        let supervisor = self.0.supervisor();
        let shot = self
            .0
            .run("screenshot", || supervisor.screenshot(&page_id))
            .await?;
        // The page may have been recovered under a new id
        Ok(ToolResponse::image(shot.data, shot.mime_type).with_content(Content::Text {
            text: json!({ "page_id": shot.page_id }).to_string(),
        }))
    }
}

pub struct EvaluateTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for EvaluateTool {
    fn name(&self) -> &str {
        "browser_evaluate"
    }

    fn description(&self) -> &str {
        "Run JavaScript in a page and return its JSON result. Accepts an expression, statements with a final expression, or a function."
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
            .required_property("page_id", page_id_property())
            .required_property("script", PropertySchema::string("JavaScript source"))
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<ToolResponse> {
        let page_id = PageId::from(arguments.require_str("page_id")?);
        let script = arguments.require_str("script")?;
        let supervisor = self.0.supervisor();
        let outcome = self
            .0
            .run("execute_script", || supervisor.execute_script(&page_id, script))
            .await?;
        ToolResponse::json(&outcome)
    }
}

pub struct ListPagesTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for ListPagesTool {
    fn name(&self) -> &str {
        "browser_list_pages"
    }

    fn description(&self) -> &str {
        "List open pages with their URLs, titles and health"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
    }

    async fn execute(&self, _arguments: ToolArguments) -> Result<ToolResponse> {
        let pages = self.0.supervisor().pages().await;
        ToolResponse::json(&json!({ "pages": pages }))
    }
}

pub struct ClosePageTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for ClosePageTool {
    fn name(&self) -> &str {
        "browser_close_page"
    }

    fn description(&self) -> &str {
        "Close a page"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object().required_property("page_id", page_id_property())
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<ToolResponse> {
        let page_id = PageId::from(arguments.require_str("page_id")?);
        let supervisor = self.0.supervisor();
        self.0
            .run("close_page", || supervisor.close_page(&page_id))
            .await?;
        ToolResponse::json(&json!({ "closed": page_id }))
    }
}

pub struct HealthTool(Arc<BrowserToolContext>);

#[async_trait]
impl Tool for HealthTool {
    fn name(&self) -> &str {
        "browser_health"
    }

    fn description(&self) -> &str {
        "Report browser process and circuit breaker health"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
    }

    async fn execute(&self, _arguments: ToolArguments) -> Result<ToolResponse> {
        let supervisor = self.0.supervisor();
        let check = self
            .0
            .run("check_health", || supervisor.check_health())
            .await;
        let process = supervisor.process_info().await;

        let (version, error) = match check {
            Ok(version) => (Some(version), None),
            Err(e) => (None, Some(e.to_string())),
        };
        ToolResponse::json(&json!({
            "healthy": version.is_some(),
            "version": version,
            "error": error,
            "circuit": self.0.breakers.health().await,
            "breakers": self.0.breakers.stats().await,
            "browser": process,
        }))
    }
}
