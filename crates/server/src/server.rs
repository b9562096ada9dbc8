//! Protocol Server - JSON-RPC dispatch over the connection channel
//!
//! Frames are handled one at a time: every request gets exactly one
//! response, in arrival order. Tool executions run on their own task so
//! a panic or a hung tool only costs that one call.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use browser::util::{duration_ms, panic_message};
use browser::{BrowserSupervisor, SupervisorEvent};
use resilience::{CancellationToken, CircuitBreakers};
use tools::{Tool, ToolArguments, ToolRegistry, ToolResponse};

use crate::channel::{ChannelError, ConnectionChannel};
use crate::error::Result;
use crate::health::run_health_loop;
use crate::protocol::{
    decode, methods, CallToolParams, Incoming, InitializeParams, Notification, Response, RpcError,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Reported as `serverInfo.name`
    pub name: String,
    pub version: String,
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    /// Bound on a single `tools/call`
    #[serde(with = "duration_ms")]
    pub tool_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "browser-pilot".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            health_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(120),
        }
    }
}

pub struct ProtocolServer {
    settings: ServerSettings,
    registry: Arc<ToolRegistry>,
    channel: Arc<ConnectionChannel>,
    breakers: CircuitBreakers,
    supervisor: Option<BrowserSupervisor>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
}

impl ProtocolServer {
    pub fn new(
        settings: ServerSettings,
        registry: Arc<ToolRegistry>,
        channel: Arc<ConnectionChannel>,
        breakers: CircuitBreakers,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            registry,
            channel,
            breakers,
            supervisor: None,
            shutdown,
            initialized: AtomicBool::new(false),
        }
    }

    /// Run health checks against this supervisor and forward its events
    pub fn with_supervisor(mut self, supervisor: BrowserSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Set once the client sends `notifications/initialized`
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Serve until the client goes away for good or shutdown is requested.
    /// A clean end of session is `Ok`.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let background = self.shutdown.child_token();
        let mut tasks: Vec<JoinHandle<()>> = vec![
            self.channel.spawn_heartbeat(background.clone()),
            self.spawn_stats_loop(background.clone()),
        ];
        if let Some(supervisor) = &self.supervisor {
            tasks.push(tokio::spawn(run_health_loop(
                supervisor.clone(),
                self.breakers.browser.clone(),
                self.settings.health_interval,
                background.clone(),
            )));
            tasks.push(self.spawn_event_forwarder(supervisor.subscribe(), background.clone()));
        }

        info!(
            tools = self.registry.len(),
            transport = %self.channel.stats().transport,
            "protocol server running"
        );
        let outcome = self.serve().await;

        background.cancel();
        for task in tasks {
            task.abort();
        }
        let stats = self.channel.stats();
        info!(
            frames_in = stats.frames_in,
            frames_out = stats.frames_out,
            reconnects = stats.reconnects,
            "protocol server stopped"
        );
        outcome
    }

    async fn serve(&self) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                frame = self.channel.read_message() => frame,
            };

            match frame {
                Ok(line) => {
                    if let Some(response) = self.handle_frame(&line).await {
                        if let Err(e) = self.channel.send(&response).await {
                            warn!(id = %response.id, error = %e, "failed to write response");
                        }
                    }
                }
                Err(ChannelError::ReadTimeout(_)) => continue,
                // Already logged and counted by the channel
                Err(ChannelError::FrameTooLarge { .. } | ChannelError::InvalidUtf8 { .. }) => continue,
                Err(e) if e.is_disconnect() => {
                    if !self.channel.reconnectable() {
                        info!("client closed the connection");
                        return Ok(());
                    }
                    warn!(error = %e, "connection lost");
                    match self.channel.reconnect(&self.shutdown).await {
                        Ok(()) => continue,
                        Err(ChannelError::Cancelled) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => warn!(error = %e, "read failed"),
            }
        }
    }

    /// Decode and dispatch one frame. `None` when nothing should be sent
    /// back: notifications, client responses, and garbage without an id.
    pub async fn handle_frame(&self, line: &str) -> Option<Response> {
        match decode(line) {
            Incoming::Request { id, method, params } => {
                let started = Instant::now();
                let response = match self.handle_request(&method, params).await {
                    Ok(result) => Response::success(id, result),
                    Err(error) => {
                        debug!(%id, %method, code = error.code, message = %error.message, "request failed");
                        Response::error(id, error)
                    }
                };
                debug!(
                    %method,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request handled"
                );
                Some(response)
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params);
                None
            }
            Incoming::Response { id } => {
                debug!(id = ?id, "ignoring response from client");
                None
            }
            Incoming::Invalid { id: Some(id), error } => {
                warn!(%id, code = error.code, data = ?error.data, "invalid message");
                Some(Response::error(id, error))
            }
            Incoming::Invalid { id: None, error } => {
                warn!(code = error.code, data = ?error.data, "dropping invalid message without an id");
                None
            }
        }
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        match method {
            methods::INITIALIZE => self.initialize(params),
            methods::TOOLS_LIST => Ok(json!({ "tools": self.registry.descriptors() })),
            methods::TOOLS_CALL => self.call_tool(params).await,
            methods::PING => Ok(json!({})),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn handle_notification(&self, method: &str, _params: Option<Value>) {
        match method {
            methods::INITIALIZED => {
                self.initialized.store(true, Ordering::Release);
                info!("session initialized");
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    fn initialize(&self, params: Option<Value>) -> std::result::Result<Value, RpcError> {
        let params: InitializeParams = match params {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| RpcError::invalid_params(e.to_string()))?,
            None => InitializeParams::default(),
        };

        if let Some(requested) = params.protocol_version.as_deref() {
            if requested != PROTOCOL_VERSION {
                warn!(
                    requested,
                    supported = PROTOCOL_VERSION,
                    "client asked for a different protocol version"
                );
            }
        }
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = ?client.version, "client connected");
        }

        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "logging": {}
            },
            "serverInfo": {
                "name": self.settings.name,
                "version": self.settings.version
            }
        }))
    }

    async fn call_tool(&self, params: Option<Value>) -> std::result::Result<Value, RpcError> {
        let params: CallToolParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let tool = self
            .registry
            .get(&params.name)
            .ok_or_else(|| RpcError::tool_not_found(&params.name))?;
        let arguments = ToolArguments::from_value(params.arguments)
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        tool.input_schema()
            .validate(arguments.as_map())
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;

        let started = Instant::now();
        let outcome = self.execute_tool(tool, arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                info!(tool = %params.name, elapsed_ms, is_error = response.is_error, "tool call completed");
                serde_json::to_value(response).map_err(|e| RpcError::tool_failed(e.to_string()))
            }
            Err(error) => {
                warn!(tool = %params.name, elapsed_ms, code = error.code, data = ?error.data, "tool call failed");
                Err(error)
            }
        }
    }

    async fn execute_tool(
        &self,
        tool: Arc<dyn Tool>,
        arguments: ToolArguments,
    ) -> std::result::Result<ToolResponse, RpcError> {
        let limit = self.settings.tool_timeout;
        let mut handle = tokio::spawn(async move { tool.execute(arguments).await });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = tokio::time::sleep(limit) => {
                handle.abort();
                return Err(RpcError::tool_failed(format!(
                    "tool timed out after {}ms",
                    limit.as_millis()
                )));
            }
            _ = self.shutdown.cancelled() => {
                handle.abort();
                return Err(RpcError::tool_failed("server shutting down"));
            }
        };

        match joined {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_invalid_arguments() => Err(RpcError::invalid_params(e.to_string())),
            Ok(Err(e)) => Err(RpcError::tool_failed(e.to_string())),
            Err(e) if e.is_panic() => Err(RpcError::tool_failed(format!(
                "tool panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(_) => Err(RpcError::tool_failed("tool task cancelled")),
        }
    }

    fn spawn_event_forwarder(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SupervisorEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => server.forward_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "supervisor events dropped before forwarding")
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Relay a supervisor event as a log notification, once the client
    /// has finished initializing
    async fn forward_event(&self, event: &SupervisorEvent) {
        if !self.is_initialized() {
            return;
        }
        let notification = Notification::new(
            methods::MESSAGE,
            Some(json!({
                "level": event.level(),
                "logger": "browser",
                "data": event
            })),
        );
        if let Err(e) = self.channel.send(&notification).await {
            debug!(error = %e, "failed to forward supervisor event");
        }
    }

    fn spawn_stats_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let period = server.settings.stats_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                server.log_stats().await;
            }
        })
    }

    async fn log_stats(&self) {
        let channel = self.channel.stats();
        info!(
            transport = %channel.transport,
            frames_in = channel.frames_in,
            frames_out = channel.frames_out,
            bytes_in = channel.bytes_in,
            bytes_out = channel.bytes_out,
            timeouts = channel.timeouts,
            oversized = channel.oversized_frames,
            reconnects = channel.reconnects,
            "connection stats"
        );
        for breaker in self.breakers.stats().await {
            info!(
                breaker = %breaker.name,
                state = %breaker.state,
                consecutive_failures = breaker.consecutive_failures,
                "circuit stats"
            );
        }
        if let Some(supervisor) = &self.supervisor {
            let process = supervisor.process_info().await;
            info!(
                state = ?process.state,
                generation = process.generation,
                pages = process.pages,
                restarts = process.restart_count,
                "browser stats"
            );
        }
    }
}
