// switchyard/src/mcp/mod.rs

//! MCP client plumbing: JSON-RPC wire types, the transport seam the
//! session manager drives, and the two session actors.

pub mod http;
pub mod manager;
pub mod stdio;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::McpError;
use crate::models::tools::McpTool;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request with a fresh 8-byte random hex id.
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: new_request_id(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: None,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub(crate) fn new_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extracts the result from a response, mapping a JSON-RPC error object
/// to [`McpError::Rpc`] and a missing result to an empty object.
pub(crate) fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc { code: error.code, message: error.message });
    }
    Ok(response.result.unwrap_or_else(|| json!({})))
}

/// Maps a `tools/call` result carrying `isError` into a tool failure.
/// The message is the first text content item when present.
pub(crate) fn tool_error_from_result(result: &Value) -> Option<McpError> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let message = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.get("text").and_then(Value::as_str))
        })
        .unwrap_or("Tool execution failed");
    Some(McpError::Tool(message.to_string()))
}

/// Parameters for the `initialize` handshake on either transport.
pub(crate) fn initialize_params(protocol_version: &str) -> Value {
    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": "switchyard",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parses a `tools/list` result into tool schemas.
pub(crate) fn parse_tool_list(result: Value) -> Result<Vec<McpTool>, McpError> {
    let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
    serde_json::from_value(tools)
        .map_err(|e| McpError::Protocol(format!("malformed tools/list result: {e}")))
}

/// Connection state of one session as the manager tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

/// One live MCP session, as the manager drives it. Implementations are
/// mailbox actors; every method serializes through the session's own
/// request queue.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError>;

    /// Invokes `tools/call` and returns the raw result envelope.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;

    async fn shutdown(&self);

    /// Whether the session actor is still running.
    fn is_alive(&self) -> bool;

    /// Resolves when the session actor has stopped.
    async fn closed(&self);
}
