//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Request/response matching via ID, events broadcast to subscribers
//! 3. Every request is time-bounded; a request that times out is forgotten
//! 4. When the socket dies every pending request fails with `Closed`, and
//!    so does every later one. Callers decide whether to restart.

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use resilience::CancellationToken;
use super::protocol::*;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("CDP request timeout: {method} after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("CDP connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("CDP websocket closed")]
    Closed,

    #[error("Invalid response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },
}

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

/// Event subscriber callback
pub type EventCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Log every frame at trace level
    pub trace_traffic: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            trace_traffic: false,
        }
    }
}

/// CDP Client - manages single WebSocket connection to browser
pub struct CDPClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Pending requests waiting for responses
    /// Key: request_id, Value: oneshot sender for response
    pending: Arc<DashMap<RequestId, oneshot::Sender<CDPResponse>>>,

    /// Event subscribers
    /// Key: method name (e.g., "Target.targetCrashed"), Value: callbacks
    subscribers: Arc<DashMap<String, Vec<EventCallback>>>,

    /// WebSocket write half; the lock serializes frames
    ws_sink: Mutex<WsSink>,

    /// Set once the reader task has exited
    closed: Arc<AtomicBool>,

    /// Stops the reader task
    shutdown: CancellationToken,

    options: ClientOptions,
}

impl CDPClient {
    /// Connect to a Chrome DevTools Protocol endpoint within `options.connect_timeout`
    pub async fn connect(ws_url: &str, options: ClientOptions) -> Result<Arc<Self>> {
        let (ws_stream, _) = tokio::time::timeout(options.connect_timeout, connect_async(ws_url))
            .await
            .map_err(|_| CDPError::ConnectTimeout(options.connect_timeout))??;
        let (sink, mut stream) = ws_stream.split();

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            ws_sink: Mutex::new(sink),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            options,
        });

        // The reader owns only what it needs, so dropping the client is not
        // blocked on the task.
        let pending = client.pending.clone();
        let subscribers = client.subscribers.clone();
        let closed = client.closed.clone();
        let shutdown = client.shutdown.clone();
        let trace_traffic = client.options.trace_traffic;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if trace_traffic {
                                    tracing::trace!(target: "cdp", "<- {}", text);
                                }
                                if let Err(e) = dispatch(&pending, &subscribers, &text) {
                                    tracing::warn!("Failed to handle CDP message: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("CDP websocket closed by browser");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!("CDP websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }

            closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every waiter with `Closed`
            pending.clear();
        });

        Ok(client)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send CDP request and wait for response
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(CDPError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CDPRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let json = serde_json::to_string(&request)?;
        if self.options.trace_traffic {
            tracing::trace!(target: "cdp", "-> {}", json);
        }
        let sent = {
            let mut sink = self.ws_sink.lock().await;
            sink.send(Message::Text(json)).await
        };
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(CDPError::WebSocket(e));
        }

        let response = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(CDPError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                return Err(CDPError::Timeout {
                    method: request.method,
                    after: self.options.request_timeout,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(CDPError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a request and decode its result
    pub async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<T> {
        let value = self.send_request(method, params, session_id).await?;
        serde_json::from_value(value).map_err(|e| CDPError::InvalidResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Subscribe to CDP events
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        self.subscribers
            .entry(method.into())
            .or_default()
            .push(callback);
    }

    /// Close connection gracefully
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut sink = self.ws_sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

impl Drop for CDPClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Route one incoming frame to its waiter or to event subscribers
fn dispatch(
    pending: &DashMap<RequestId, oneshot::Sender<CDPResponse>>,
    subscribers: &DashMap<String, Vec<EventCallback>>,
    text: &str,
) -> Result<()> {
    match serde_json::from_str::<CDPMessage>(text)? {
        CDPMessage::Response(response) => {
            if let Some((_, tx)) = pending.remove(&response.id) {
                let _ = tx.send(response); // receiver may have timed out
            } else {
                tracing::debug!("Response for unknown or expired request: {}", response.id);
            }
        }
        CDPMessage::Event(event) => {
            if let Some(callbacks) = subscribers.get(&event.method) {
                for callback in callbacks.value() {
                    callback(event.clone());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_resolves_pending_request() {
        let pending = DashMap::new();
        let subscribers = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(3, tx);

        dispatch(&pending, &subscribers, r#"{"id":3,"result":{"product":"Chrome"}}"#).unwrap();

        let response = rx.try_recv().unwrap();
        assert_eq!(response.result.unwrap()["product"], "Chrome");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_dispatch_fans_out_events() {
        let pending = DashMap::new();
        let subscribers: DashMap<String, Vec<EventCallback>> = DashMap::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        subscribers
            .entry("Target.targetDestroyed".to_string())
            .or_default()
            .push(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        dispatch(
            &pending,
            &subscribers,
            r#"{"method":"Target.targetDestroyed","params":{"targetId":"T"}}"#,
        )
        .unwrap();
        dispatch(&pending, &subscribers, r#"{"method":"Page.loadEventFired"}"#).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_error_reads_as_transient() {
        // Retry classification matches on this text
        assert!(CDPError::Closed.to_string().contains("websocket closed"));
        let timeout = CDPError::Timeout {
            method: "Page.navigate".into(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.to_string().contains("timeout"));
    }

    // Note: Real tests need a running Chrome instance
    #[tokio::test]
    #[ignore]
    async fn test_connect() {
        let client = CDPClient::connect(
            "ws://localhost:9222/devtools/browser",
            ClientOptions::default(),
        )
        .await
        .unwrap();

        let result = client
            .send_request("Browser.getVersion", None, None)
            .await
            .unwrap();

        println!("Browser version: {:?}", result);
    }
}
