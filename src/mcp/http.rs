// switchyard/src/mcp/http.rs

//! One MCP session over HTTP. Requests are JSON-RPC POSTs carrying the
//! session id captured at initialize time; replies arrive either as
//! plain JSON or framed as a Server-Sent-Events body.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    extract_result, initialize_params, parse_tool_list, tool_error_from_result, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, Transport,
};
use crate::config::HttpServerConfig;
use crate::errors::McpError;
use crate::models::tools::McpTool;

pub(crate) const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const EXECUTION_ID_HEADER: &str = "Execution-Id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

enum Request {
    ListTools { reply: oneshot::Sender<Result<Vec<McpTool>, McpError>> },
    CallTool { name: String, arguments: Value, reply: oneshot::Sender<Result<Value, McpError>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to one HTTP session actor.
#[derive(Clone)]
pub struct HttpSession {
    tx: mpsc::Sender<Request>,
}

impl HttpSession {
    /// Performs the initialize handshake and starts the session actor.
    pub async fn connect(config: HttpServerConfig) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::Connect(e.to_string()))?;

        let mut state = SessionState { http, config, session_id: None };
        state.initialize().await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_actor(state, rx));
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, McpError>>) -> Request,
    ) -> Result<T, McpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| McpError::ServerCrashed("session actor stopped".to_string()))?;
        rx.await
            .map_err(|_| McpError::ServerCrashed("session actor stopped".to_string()))?
    }
}

#[async_trait]
impl Transport for HttpSession {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        self.request(|reply| Request::ListTools { reply }).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.request(|reply| Request::CallTool {
            name: name.to_string(),
            arguments,
            reply,
        })
        .await
    }

    async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

async fn run_actor(mut state: SessionState, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::ListTools { reply } => {
                let result = state.list_tools().await;
                let _ = reply.send(result);
            }
            Request::CallTool { name, arguments, reply } => {
                let result = state.call_tool(&name, arguments).await;
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
}

struct SessionState {
    http: reqwest::Client,
    config: HttpServerConfig,
    session_id: Option<String>,
}

impl SessionState {
    async fn initialize(&mut self) -> Result<(), McpError> {
        let request =
            JsonRpcRequest::new("initialize", Some(initialize_params(PROTOCOL_VERSION)));
        let response = self
            .base_request(CONNECT_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 && status != 202 {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Connect(format!(
                "initialize failed with status {status}: {body}"
            )));
        }

        // Header lookup is case-insensitive; a multi-valued header
        // contributes its first value.
        let session_id = response
            .headers()
            .get_all(SESSION_ID_HEADER)
            .iter()
            .next()
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| McpError::Connect("No session ID received from server".to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;
        let frame = parse_body(&body)?;
        if let Some(error) = frame.get("error") {
            return Err(McpError::Connect(format!("initialize rejected: {error}")));
        }

        self.session_id = Some(session_id.clone());

        let note = JsonRpcNotification::new("notifications/initialized");
        let response = self
            .base_request(CONNECT_TIMEOUT)
            .header(SESSION_ID_HEADER, &session_id)
            .json(&note)
            .send()
            .await
            .map_err(|e| McpError::Connect(e.to_string()))?;
        match response.status().as_u16() {
            200 | 202 => {
                info!(url = %self.config.url, session_id = %session_id, "HTTP MCP session established");
                Ok(())
            }
            status => Err(McpError::Connect(format!(
                "initialized notification rejected with status {status}"
            ))),
        }
    }

    async fn list_tools(&mut self) -> Result<Vec<McpTool>, McpError> {
        let request = JsonRpcRequest::new("tools/list", Some(json!({})));
        let result = self.post_rpc(&request, LIST_TOOLS_TIMEOUT, false).await?;
        parse_tool_list(result)
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let request = JsonRpcRequest::new(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        );
        let result = self.post_rpc(&request, CALL_TOOL_TIMEOUT, true).await?;
        if let Some(error) = tool_error_from_result(&result) {
            return Err(error);
        }
        Ok(result)
    }

    fn base_request(&self, timeout: Duration) -> reqwest::RequestBuilder {
        self.http
            .post(&self.config.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("Authorization", format!("Bearer {}", self.config.auth_token))
    }

    async fn post_rpc(
        &mut self,
        request: &JsonRpcRequest,
        timeout: Duration,
        is_tool_call: bool,
    ) -> Result<Value, McpError> {
        let session_id = self
            .session_id
            .clone()
            .ok_or(McpError::SessionExpired)?;

        let mut builder = self
            .base_request(timeout)
            .header(SESSION_ID_HEADER, &session_id);
        if is_tool_call {
            if let Some(execution_id) = &self.config.execution_id {
                builder = builder.header(EXECUTION_ID_HEADER, execution_id);
            }
        }

        let response = builder.json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::OperationTimeout(timeout)
            } else {
                McpError::ServerCrashed(e.to_string())
            }
        })?;

        match response.status().as_u16() {
            200 => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| McpError::ServerCrashed(e.to_string()))?;
                let frame: JsonRpcResponse = serde_json::from_value(parse_body(&body)?)
                    .map_err(|e| McpError::Protocol(format!("malformed response frame: {e}")))?;
                extract_result(frame)
            }
            // Acknowledgement for notifications.
            202 => Ok(Value::Object(Map::new())),
            404 => {
                warn!(url = %self.config.url, "MCP session expired, clearing session id");
                self.session_id = None;
                Err(McpError::SessionExpired)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(McpError::Http { status, body })
            }
        }
    }
}

/// Parses a response body that is either plain JSON or SSE-framed.
///
/// An SSE body starts with `event: `; the payload is the first
/// `data: ` line. A data line that fails to parse, or SSE with no data
/// line, yields an empty object so the caller sees an absent result.
fn parse_body(body: &str) -> Result<Value, McpError> {
    if body.starts_with("event: ") {
        let payload = body
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .and_then(|data| serde_json::from_str(data).ok())
            .unwrap_or_else(|| json!({}));
        return Ok(payload);
    }
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(body).map_err(|e| {
        debug!(error = %e, "MCP response body was not JSON");
        McpError::Protocol(format!("malformed response body: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn config_for(server: &MockServer) -> HttpServerConfig {
        HttpServerConfig {
            url: format!("{}/rpc", server.base_url()),
            auth_token: "tok-1".to_string(),
            execution_id: Some("exec-7".to_string()),
        }
    }

    fn sse_frame(value: &Value) -> String {
        format!("event: message\ndata: {value}\n\n")
    }

    async fn mock_handshake(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rpc")
                    .header("Authorization", "Bearer tok-1")
                    .body_includes("\"method\":\"initialize\"");
                then.status(200)
                    .header("mcp-session-id", "sess-42")
                    .json_body(json!({ "jsonrpc": "2.0", "id": "1", "result": {} }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rpc")
                    .body_includes("notifications/initialized");
                then.status(202);
            })
            .await;
    }

    #[tokio::test]
    async fn connect_captures_session_id_case_insensitively() {
        let server = MockServer::start_async().await;
        mock_handshake(&server).await;

        let session = HttpSession::connect(config_for(&server)).await;
        assert!(session.is_ok(), "connect failed: {:?}", session.err());
    }

    #[tokio::test]
    async fn connect_fails_without_session_id() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rpc");
                then.status(200)
                    .json_body(json!({ "jsonrpc": "2.0", "id": "1", "result": {} }));
            })
            .await;

        let result = HttpSession::connect(config_for(&server)).await;
        match result {
            Err(McpError::Connect(message)) => {
                assert!(message.contains("No session ID received from server"));
            }
            other => panic!("expected connect error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn list_tools_parses_sse_framed_reply() {
        let server = MockServer::start_async().await;
        mock_handshake(&server).await;

        let tools_frame = json!({
            "jsonrpc": "2.0",
            "id": "2",
            "result": { "tools": [{
                "name": "search",
                "description": "Searches",
                "inputSchema": { "type": "object", "properties": {} }
            }]}
        });
        let list = server
            .mock_async(move |when, then| {
                when.method(POST)
                    .path("/rpc")
                    .header("mcp-session-id", "sess-42")
                    .body_includes("tools/list");
                then.status(200)
                    .header("Content-Type", "text/event-stream")
                    .body(sse_frame(&tools_frame));
            })
            .await;

        let session = HttpSession::connect(config_for(&server)).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        list.assert_async().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }

    #[tokio::test]
    async fn call_tool_sends_execution_id_and_unwraps_result() {
        let server = MockServer::start_async().await;
        mock_handshake(&server).await;

        let call = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rpc")
                    .header("mcp-session-id", "sess-42")
                    .header("execution-id", "exec-7")
                    .body_includes("tools/call");
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": "3",
                    "result": { "content": [{ "type": "text", "text": "hit" }] }
                }));
            })
            .await;

        let session = HttpSession::connect(config_for(&server)).await.unwrap();
        let result = session
            .call_tool("search", json!({ "q": "rust" }))
            .await
            .unwrap();
        call.assert_async().await;
        assert_eq!(result["content"][0]["text"], json!("hit"));
    }

    #[tokio::test]
    async fn call_tool_surfaces_is_error_flag() {
        let server = MockServer::start_async().await;
        mock_handshake(&server).await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/rpc").body_includes("tools/call");
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": "3",
                    "result": {
                        "isError": true,
                        "content": [{ "type": "text", "text": "no such index" }]
                    }
                }));
            })
            .await;

        let session = HttpSession::connect(config_for(&server)).await.unwrap();
        let result = session.call_tool("search", json!({})).await;
        match result {
            Err(McpError::Tool(message)) => assert_eq!(message, "no such index"),
            other => panic!("expected tool error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_404_expires_the_session() {
        let server = MockServer::start_async().await;
        mock_handshake(&server).await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/rpc").body_includes("tools/call");
                then.status(404);
            })
            .await;

        let session = HttpSession::connect(config_for(&server)).await.unwrap();
        let first = session.call_tool("search", json!({})).await;
        assert!(matches!(first, Err(McpError::SessionExpired)));

        // The session id was cleared; the next call fails the same way
        // without reaching the server.
        let second = session.call_tool("search", json!({})).await;
        assert!(matches!(second, Err(McpError::SessionExpired)));
    }

    #[test]
    fn parse_body_handles_sse_and_json() {
        let value = json!({ "result": { "ok": true } });
        assert_eq!(parse_body(&format!("event: message\ndata: {value}\n\n")).unwrap(), value);
        assert_eq!(parse_body(&value.to_string()).unwrap(), value);
        // SSE with no data line, and an unparseable data line, both
        // yield an empty object.
        assert_eq!(parse_body("event: message\n\n").unwrap(), json!({}));
        assert_eq!(parse_body("event: message\ndata: {broken\n\n").unwrap(), json!({}));
    }
}
