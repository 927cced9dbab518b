use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::error::TarsyError;
use crate::mcp::transport::{read_message, send_notification, send_request, McpMessage, StdioTransport};
use crate::mcp::types::{CallToolResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult, McpToolDef};

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, TarsyError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TarsyError>;
}

/// A live MCP server reached over stdio JSON-RPC. Spawns the server process,
/// runs a background reader loop that demultiplexes responses onto
/// per-request oneshot channels by request id, and performs the
/// `initialize`/`initialized` handshake on construction.
pub struct StdioMcpClient {
    writer: Mutex<tokio::io::BufWriter<tokio::process::ChildStdin>>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<crate::mcp::types::JsonRpcResponse>>>>,
    _child: Mutex<tokio::process::Child>,
}

impl StdioMcpClient {
    pub async fn spawn(command: &str, args: &[String]) -> Result<Arc<Self>, TarsyError> {
        let transport = StdioTransport::spawn(command, args).map_err(|e| TarsyError::McpTool(e.to_string()))?;
        let StdioTransport { child, writer, mut reader } = transport;

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let client = Arc::new(Self {
            writer: Mutex::new(writer),
            next_id: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            _child: Mutex::new(child),
        });

        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(McpMessage::Response(resp)) => {
                        if let Some(id) = resp.id.as_u64() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "mcp reader loop terminated");
                        break;
                    }
                }
            }
        });

        client.initialize().await?;
        Ok(client)
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<crate::mcp::types::JsonRpcResponse, TarsyError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest { jsonrpc: "2.0".into(), method: method.into(), params, id: json!(id) };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            send_request(&mut writer, &request).await.map_err(|e| TarsyError::McpTool(e.to_string()))?;
        }

        rx.await.map_err(|_| TarsyError::McpTool("mcp response channel closed".into()))
    }

    async fn initialize(&self) -> Result<(), TarsyError> {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "tarsy", "version": env!("CARGO_PKG_VERSION") },
        });
        let resp = self.send("initialize", Some(params)).await?;
        if let Some(err) = resp.error {
            return Err(TarsyError::McpTool(err.message));
        }

        let notif = JsonRpcNotification {
            jsonrpc: "2.0".into(),
            method: "notifications/initialized".into(),
            params: Some(json!({})),
        };
        let mut writer = self.writer.lock().await;
        send_notification(&mut writer, &notif).await.map_err(|e| TarsyError::McpTool(e.to_string()))
    }
}

#[async_trait]
impl McpClient for StdioMcpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, TarsyError> {
        let resp = self.send("tools/list", Some(json!({}))).await?;
        if let Some(err) = resp.error {
            return Err(TarsyError::McpTool(err.message));
        }
        let result: ListToolsResult =
            serde_json::from_value(resp.result.unwrap_or_default()).map_err(TarsyError::Serialization)?;
        Ok(result.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TarsyError> {
        let params = json!({ "name": name, "arguments": arguments });
        let resp = self.send("tools/call", Some(params)).await?;
        if let Some(err) = resp.error {
            return Err(TarsyError::McpTool(err.message));
        }
        let result: CallToolResult =
            serde_json::from_value(resp.result.unwrap_or_default()).map_err(TarsyError::Serialization)?;
        if result.is_error {
            return Err(TarsyError::McpTool(result.as_value().to_string()));
        }
        Ok(result.as_value())
    }
}

/// Scripted MCP client for tests: each tool name has a queue of canned
/// results, consumed in order. Calling a tool with an empty queue is a
/// test-author bug, not a real failure mode, so it panics.
pub struct MockMcpClient {
    tools: Vec<McpToolDef>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl MockMcpClient {
    pub fn new(tools: Vec<McpToolDef>) -> Self {
        Self { tools, responses: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    pub async fn push_response(&self, tool: impl Into<String>, response: Result<Value, String>) {
        self.responses.lock().await.entry(tool.into()).or_default().push_back(response);
    }
}

#[async_trait]
impl McpClient for MockMcpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, TarsyError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TarsyError> {
        self.calls.lock().await.push((name.to_string(), arguments));
        let mut responses = self.responses.lock().await;
        let queue = responses.entry(name.to_string()).or_default();
        match queue.pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(TarsyError::McpTool(message)),
            None => panic!("MockMcpClient: no scripted response left for tool '{name}'"),
        }
    }
}
