//! MCP server over stdio
//!
//! Newline-delimited JSON-RPC 2.0 on stdin/stdout. Requests run as separate
//! tasks so a long `voice_listen` never blocks `tools/list`. Every change to
//! the loaded tool groups is pushed to the client as
//! `notifications/tools/list_changed`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::MailboxHandlers;
use crate::error::Result;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

/// Incoming request or notification.
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The notification sent whenever the loaded tool set changes.
pub fn list_changed_notification() -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": "notifications/tools/list_changed",
    })
}

/// Serves [`MailboxHandlers`] to an MCP client.
pub struct McpServer {
    handlers: Arc<MailboxHandlers>,
}

impl McpServer {
    pub fn new(handlers: Arc<MailboxHandlers>) -> Self {
        Self { handlers }
    }

    /// Handle one line of input.
    ///
    /// Returns the response to write back, or `None` for notifications and
    /// blank lines.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                return Some(
                    JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("Invalid JSON: {}", e))
                        .into_value(),
                )
            }
        };
        let id = raw.get("id").cloned();

        let request: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                return id.map(|id| {
                    JsonRpcResponse::error(id, INVALID_REQUEST, format!("Invalid request: {}", e))
                        .into_value()
                })
            }
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return request.id.map(|id| {
                JsonRpcResponse::error(id, INVALID_REQUEST, "Invalid JSON-RPC version").into_value()
            });
        }

        let Some(id) = request.id else {
            self.handle_notification(&request.method, &request.params);
            return None;
        };

        Some(self.handle_request(id, &request.method, &request.params).await.into_value())
    }

    fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            "initialized" | "notifications/initialized" => info!("MCP client initialized"),
            "notifications/cancelled" => info!(params = %params, "MCP request cancelled"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: &Value) -> JsonRpcResponse {
        match method {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .handlers
                    .list_tools()
                    .await
                    .into_iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                if name.is_empty() {
                    return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing tool name in params");
                }
                let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let response = self.handlers.call_tool(name, &args).await;
                match serde_json::to_value(&response) {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
                }
            }
            other => {
                JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Unknown method: {}", other))
            }
        }
    }

    /// Serve requests from `reader` until it reaches EOF.
    ///
    /// Requests still running at EOF are aborted, which drops any listen
    /// in progress and with it the listener lease.
    pub async fn run<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = rx.recv().await {
                let mut line = message.to_string();
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Failed to write MCP message");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    warn!(error = %e, "Failed to flush MCP output");
                    break;
                }
            }
        });

        let notifier = {
            let mut changes = self.handlers.registry().subscribe();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            debug!(loaded = ?change.loaded, unloaded = ?change.unloaded, "Tool list changed");
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "Tool list change events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    if tx.send(list_changed_notification()).is_err() {
                        break;
                    }
                }
            })
        };

        info!("MCP server running on stdio");
        let mut lines = reader.lines();
        let mut tasks = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e.into()),
                    };
                    let server = self.clone();
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        if let Some(response) = server.handle_line(&line).await {
                            let _ = tx.send(response);
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "MCP request task failed");
                    }
                }
            }
        };

        info!("MCP input closed, shutting down");
        tasks.shutdown().await;
        notifier.abort();
        drop(tx);
        let _ = writer_task.await;
        outcome
    }

    /// Serve on the process's stdin and stdout.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        self.run(reader, tokio::io::stdout()).await
    }
}
