// switchyard/src/mcp/stdio.rs

//! One MCP session over a spawned child process, newline-delimited
//! JSON-RPC on stdin/stdout. Stdout lines that are not JSON objects are
//! treated as server log output; stderr is drained into tracing.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{
    extract_result, initialize_params, parse_tool_list, tool_error_from_result, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, Transport,
};
use crate::config::StdioServerConfig;
use crate::errors::McpError;
use crate::models::tools::McpTool;

pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
/// Settle time after `notifications/initialized` so the server reaches
/// its initialized state before the first request.
const INIT_SETTLE: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const LINE_BUFFER_CAPACITY: usize = 8 * 1024;

enum Request {
    ListTools { reply: oneshot::Sender<Result<Vec<McpTool>, McpError>> },
    CallTool { name: String, arguments: Value, reply: oneshot::Sender<Result<Value, McpError>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to one stdio session actor. Cloneable; requests are
/// serialized through the actor's mailbox.
#[derive(Clone)]
pub struct StdioSession {
    tx: mpsc::Sender<Request>,
}

impl StdioSession {
    /// Spawns the configured child process, performs the initialize
    /// handshake, and starts the session actor.
    pub async fn connect(config: StdioServerConfig) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Spawn(format!("{}: {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("failed to capture stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(config.command.clone(), stderr);
        }

        let mut io = ChannelIo {
            writer: stdin,
            reader: BufReader::with_capacity(LINE_BUFFER_CAPACITY, stdout),
        };

        let session_id = match tokio::time::timeout(CONNECT_TIMEOUT, handshake(&mut io)).await {
            Ok(Ok(session_id)) => session_id,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(McpError::Connect(format!(
                    "initialize timed out after {}s",
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };

        info!(command = %config.command, session_id = %session_id, "Stdio MCP session established");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_actor(io, child, rx));
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
impl Transport for StdioSession {
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

/// The child's protocol channel: one writer, one line-buffered reader.
struct ChannelIo {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// A fault below the request/response layer.
#[derive(Debug)]
enum ReadFault {
    /// A `{`-prefixed line that did not parse as JSON.
    InvalidJson(String),
    /// The child closed stdout.
    Closed,
    Io(String),
}

impl ChannelIo {
    async fn write_frame(&mut self, frame: &impl serde::Serialize) -> Result<(), ReadFault> {
        let mut line = serde_json::to_string(frame)
            .map_err(|e| ReadFault::Io(format!("failed to serialize frame: {e}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ReadFault::Io(format!("failed to write to stdin: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ReadFault::Io(format!("failed to flush stdin: {e}")))
    }

    /// Reads frames until the response matching `id` arrives. Lines
    /// whose trimmed content does not start with `{` are server log
    /// output; frames for other ids (including stale replies from a
    /// timed-out request) are skipped.
    async fn read_response(&mut self, id: &str) -> Result<JsonRpcResponse, ReadFault> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ReadFault::Io(format!("failed to read from stdout: {e}")))?;
            if n == 0 {
                return Err(ReadFault::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with('{') {
                trace!(line = %trimmed, "Discarding server log line");
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(response) => response,
                Err(e) => return Err(ReadFault::InvalidJson(e.to_string())),
            };
            match &response.id {
                Some(Value::String(rid)) if rid == id => return Ok(response),
                _ => {
                    trace!("Skipping frame for another request id");
                    continue;
                }
            }
        }
    }

    async fn roundtrip(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, ReadFault> {
        self.write_frame(request).await?;
        self.read_response(&request.id).await
    }
}

/// Initialize handshake: `initialize`, `notifications/initialized`, a
/// short settle pause, then the session id from the reply (synthesized
/// when the server does not provide one; on stdio it is only an
/// identifier, not a correlation key).
async fn handshake(io: &mut ChannelIo) -> Result<String, McpError> {
    let request = JsonRpcRequest::new("initialize", Some(initialize_params(PROTOCOL_VERSION)));
    let response = io
        .roundtrip(&request)
        .await
        .map_err(|fault| McpError::Connect(fault_message(fault)))?;
    let result = extract_result(response)?;

    io.write_frame(&JsonRpcNotification::new("notifications/initialized"))
        .await
        .map_err(|fault| McpError::Connect(fault_message(fault)))?;
    tokio::time::sleep(INIT_SETTLE).await;

    Ok(result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
}

fn fault_message(fault: ReadFault) -> String {
    match fault {
        ReadFault::InvalidJson(e) => format!("invalid_json: {e}"),
        ReadFault::Closed => "server stdout closed".to_string(),
        ReadFault::Io(e) => e,
    }
}

async fn run_actor(mut io: ChannelIo, mut child: Child, mut rx: mpsc::Receiver<Request>) {
    let mut crashed = false;
    while let Some(request) = rx.recv().await {
        match request {
            Request::ListTools { reply } => {
                let result = list_tools(&mut io).await;
                crashed = matches!(&result, Err(McpError::ServerCrashed(_)));
                let _ = reply.send(result);
            }
            Request::CallTool { name, arguments, reply } => {
                let result = call_tool(&mut io, &name, arguments).await;
                crashed = matches!(&result, Err(McpError::ServerCrashed(_)));
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
        if crashed {
            break;
        }
    }
    terminate(io, &mut child).await;
}

async fn list_tools(io: &mut ChannelIo) -> Result<Vec<McpTool>, McpError> {
    let request = JsonRpcRequest::new("tools/list", Some(json!({})));
    let response = tokio::time::timeout(LIST_TOOLS_TIMEOUT, io.roundtrip(&request))
        .await
        .map_err(|_| McpError::OperationTimeout(LIST_TOOLS_TIMEOUT))?
        .map_err(|fault| match fault {
            ReadFault::InvalidJson(e) => McpError::Protocol(format!("invalid_json: {e}")),
            fault => McpError::ServerCrashed(fault_message(fault)),
        })?;
    parse_tool_list(extract_result(response)?)
}

async fn call_tool(io: &mut ChannelIo, name: &str, arguments: Value) -> Result<Value, McpError> {
    let request = JsonRpcRequest::new(
        "tools/call",
        Some(json!({ "name": name, "arguments": arguments })),
    );
    let response = tokio::time::timeout(CALL_TOOL_TIMEOUT, io.roundtrip(&request))
        .await
        .map_err(|_| McpError::OperationTimeout(CALL_TOOL_TIMEOUT))?
        // During a tool call every channel fault, invalid_json included,
        // escalates to a crash so the manager reconnects.
        .map_err(|fault| McpError::ServerCrashed(fault_message(fault)))?;
    let result = extract_result(response)?;
    if let Some(error) = tool_error_from_result(&result) {
        return Err(error);
    }
    Ok(result)
}

async fn terminate(io: ChannelIo, child: &mut Child) {
    // Closing stdin is the shutdown signal for a well-behaved server.
    drop(io);
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "MCP child exited"),
        _ => {
            warn!("MCP child did not exit, killing");
            let _ = child.kill().await;
        }
    }
}

fn drain_stderr(command: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(command = %command, line = %line, "MCP server stderr");
        }
    });
}
