//! End-to-end sessions against the protocol server over an in-memory pipe

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use browser::testing::FakeLauncher;
use browser::{BrowserSupervisor, SupervisorConfig};
use resilience::{CancellationToken, CircuitBreakers};
use server::{ChannelConfig, ConnectionChannel, ProtocolServer, ServerSettings, StreamTransport};
use tools::{
    register_browser_tools, BrowserToolContext, PropertySchema, Tool, ToolArguments, ToolRegistry,
    ToolResponse, ToolSchema,
};

const WAIT: Duration = Duration::from_secs(5);

struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the message"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object().required_property("message", PropertySchema::string("Text to echo"))
    }

    async fn execute(&self, arguments: ToolArguments) -> tools::Result<ToolResponse> {
        Ok(ToolResponse::text(arguments.require_str("message")?))
    }
}

struct Explode;

#[async_trait]
impl Tool for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Panic"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
    }

    async fn execute(&self, _arguments: ToolArguments) -> tools::Result<ToolResponse> {
        panic!("boom");
    }
}

struct Stall;

#[async_trait]
impl Tool for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    fn description(&self) -> &str {
        "Never finish in time"
    }

    fn input_schema(&self) -> ToolSchema {
        ToolSchema::object()
    }

    async fn execute(&self, _arguments: ToolArguments) -> tools::Result<ToolResponse> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ToolResponse::text("late"))
    }
}

fn test_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Echo)).unwrap();
    registry.register(Arc::new(Explode)).unwrap();
    registry.register(Arc::new(Stall)).unwrap();
    registry
}

struct Session {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    server: JoinHandle<server::Result<()>>,
}

impl Session {
    async fn start(registry: ToolRegistry, settings: ServerSettings, supervisor: Option<BrowserSupervisor>) -> Self {
        let (client, remote) = tokio::io::duplex(64 * 1024);
        let (server_reader, server_writer) = tokio::io::split(remote);
        let transport = Arc::new(StreamTransport::new(server_reader, server_writer));
        let channel = ConnectionChannel::connect(transport, ChannelConfig::default())
            .await
            .unwrap();

        let mut server = ProtocolServer::new(
            settings,
            Arc::new(registry),
            Arc::new(channel),
            CircuitBreakers::default(),
            CancellationToken::new(),
        );
        if let Some(supervisor) = supervisor {
            server = server.with_supervisor(supervisor);
        }
        let server = tokio::spawn(Arc::new(server).run());

        let (reader, writer) = tokio::io::split(client);
        Self {
            writer,
            lines: BufReader::new(reader).lines(),
            server,
        }
    }

    async fn send(&mut self, frame: &str) {
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("no frame from server")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_str(&line).unwrap()
    }

    /// Send a request and wait for its response, skipping notifications
    async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send(&frame.to_string()).await;
        loop {
            let message = self.recv().await;
            if message["id"] == id {
                return message;
            }
        }
    }

    async fn call(&mut self, id: i64, tool: &str, arguments: Value) -> Value {
        self.request(id, "tools/call", json!({"name": tool, "arguments": arguments}))
            .await
    }
}

#[tokio::test]
async fn test_initialize_then_echo() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;

    let init = session
        .request(1, "initialize", json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": "it"}}))
        .await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(init["result"]["serverInfo"]["name"], "browser-pilot");
    session
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await;

    let list = session.request(2, "tools/list", json!({})).await;
    let names: Vec<&str> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["echo", "explode", "stall"]);

    let echoed = session.call(3, "echo", json!({"message": "hi"})).await;
    assert_eq!(echoed["jsonrpc"], "2.0");
    assert_eq!(echoed["result"]["content"][0]["type"], "text");
    assert_eq!(echoed["result"]["content"][0]["text"], "hi");
    assert!(echoed.get("error").is_none());
}

#[tokio::test]
async fn test_missing_tool_does_not_end_session() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;

    let missing = session.call(1, "nope", json!({})).await;
    assert_eq!(missing["error"]["code"], -32601);
    assert_eq!(missing["error"]["message"], "Tool not found: nope");

    let echoed = session.call(2, "echo", json!({"message": "still here"})).await;
    assert_eq!(echoed["result"]["content"][0]["text"], "still here");
}

#[tokio::test]
async fn test_one_response_per_request() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;

    session
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"message":"a"}}}"#)
        .await;
    session
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"missing"}}"#)
        .await;
    session
        .send(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{}}}"#)
        .await;
    session
        .send(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"explode"}}"#)
        .await;
    session.send(r#"{"jsonrpc":"2.0","id":5,"method":"#).await;
    session
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await;
    session.send("garbage").await;
    session.send("").await;
    session.send(r#"{"jsonrpc":"2.0","id":6,"method":"ping"}"#).await;

    let mut codes = HashMap::new();
    for expected in 1..=6 {
        let message = session.recv().await;
        assert_eq!(message["id"], expected, "responses arrive in request order");
        codes.insert(expected, message["error"]["code"].as_i64());
    }
    assert_eq!(codes[&1], None);
    assert_eq!(codes[&2], Some(-32601));
    assert_eq!(codes[&3], Some(-32602));
    assert_eq!(codes[&4], Some(-32603));
    assert_eq!(codes[&5], Some(-32700));
    assert_eq!(codes[&6], None);

    let extra = tokio::time::timeout(Duration::from_millis(200), session.lines.next_line()).await;
    assert!(extra.is_err(), "unexpected extra frame: {:?}", extra);
}

#[tokio::test]
async fn test_panicking_tool_reports_message() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;

    let response = session.call(1, "explode", json!({})).await;
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(response["error"]["message"], "Tool execution failed");
    assert!(response["error"]["data"].as_str().unwrap().contains("boom"));

    let pong = session.request(2, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
}

#[tokio::test]
async fn test_tool_timeout() {
    let settings = ServerSettings {
        tool_timeout: Duration::from_millis(100),
        ..ServerSettings::default()
    };
    let mut session = Session::start(test_tools(), settings, None).await;

    let response = session.call(1, "stall", json!({})).await;
    assert_eq!(response["error"]["code"], -32603);
    assert!(response["error"]["data"].as_str().unwrap().contains("timed out"));

    let echoed = session.call(2, "echo", json!({"message": "after"})).await;
    assert_eq!(echoed["result"]["content"][0]["text"], "after");
}

#[tokio::test]
async fn test_invalid_utf8_frame_dropped() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;

    session
        .writer
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"p\xffng\"}\n")
        .await
        .unwrap();
    let pong = session.request(2, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    let extra = tokio::time::timeout(Duration::from_millis(200), session.lines.next_line()).await;
    assert!(extra.is_err(), "unexpected extra frame: {:?}", extra);
}

#[tokio::test]
async fn test_client_eof_ends_session() {
    let mut session = Session::start(test_tools(), ServerSettings::default(), None).await;
    let pong = session.request(1, "ping", json!({})).await;
    assert_eq!(pong["id"], 1);

    session.writer.shutdown().await.unwrap();
    let outcome = tokio::time::timeout(WAIT, session.server).await.unwrap().unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_browser_tools_and_event_forwarding() {
    let launcher = Arc::new(FakeLauncher::new());
    let config = SupervisorConfig {
        check_reachability: false,
        ..SupervisorConfig::default()
    };
    let supervisor = BrowserSupervisor::new(config, launcher.clone());
    supervisor.start().await.unwrap();

    let breakers = CircuitBreakers::default();
    let context = BrowserToolContext::new(supervisor.clone(), breakers, CancellationToken::new());
    let mut registry = ToolRegistry::new();
    register_browser_tools(&mut registry, Arc::new(context)).unwrap();

    let mut session = Session::start(registry, ServerSettings::default(), Some(supervisor.clone())).await;
    session.request(1, "initialize", json!({})).await;
    session
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await;

    session
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"browser_new_page","arguments":{"url":"https://example.com"}}}"#)
        .await;

    let mut response = None;
    let mut opened = None;
    while response.is_none() || opened.is_none() {
        let message = session.recv().await;
        if message["id"] == 2 {
            response = Some(message);
        } else if message["method"] == "notifications/message"
            && message["params"]["data"]["event"] == "page_opened"
        {
            opened = Some(message);
        }
    }

    let response = response.unwrap();
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let page: Value = serde_json::from_str(text).unwrap();
    assert_eq!(page["url"], "https://example.com");
    assert!(page["page_id"].as_str().unwrap().starts_with("page-"));

    let opened = opened.unwrap();
    assert_eq!(opened["params"]["logger"], "browser");
    assert_eq!(opened["params"]["level"], "debug");
    assert_eq!(opened["params"]["data"]["page_id"], page["page_id"]);
    assert_eq!(launcher.launch_count(), 1);

    supervisor.stop().await;
}
