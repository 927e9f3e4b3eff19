// switchyard/src/errors.rs
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Statuses the completion client will retry.
pub(crate) const RETRYABLE_STATUSES: [u16; 6] = [429, 500, 502, 503, 504, 508];

/// Errors from the chat-completion HTTP client.
#[derive(Error, Debug)]
pub enum ApiError {
    /// A non-2xx status, or a provider error embedded in a 2xx body.
    #[error("API error: {status} - {body}")]
    Status { status: u16, body: Value },

    /// The request never produced a usable HTTP response.
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 2xx response whose body did not deserialize into a completion.
    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether the retry loop should attempt this request again.
    ///
    /// Retryable: the status set in [`RETRYABLE_STATUSES`], and transport
    /// errors that indicate a closed/refused/timed-out connection. Any
    /// other status (400, 401, 403, 404, ...) and any other transport
    /// error surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
            ApiError::Transport(e) => e.is_timeout() || e.is_connect(),
            ApiError::InvalidResponse(_) => false,
        }
    }
}

/// Errors from MCP sessions and the session manager.
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Failed to spawn MCP server: {0}")]
    Spawn(String),

    #[error("Failed to connect to MCP server: {0}")]
    Connect(String),

    /// The session's process or connection failed mid-operation. The
    /// manager responds with one reconnect-and-retry before surfacing.
    #[error("MCP server crashed: {0}")]
    ServerCrashed(String),

    /// A bounded operation overran its deadline. The session stays
    /// connected; the server is likely alive but slow.
    #[error("MCP operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// The HTTP server no longer recognizes our session id.
    #[error("MCP session expired")]
    SessionExpired,

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The server executed the tool and reported `isError`.
    #[error("{0}")]
    Tool(String),

    /// A JSON-RPC error object returned by the server.
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A malformed frame or body outside of a tool call.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An unexpected HTTP status from an MCP server.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

/// Errors surfaced by the chat loop itself.
///
/// Tool-execution failures never appear here; they become tool-role
/// messages the model sees on its next turn.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Completion response contained no choices")]
    NoChoices,

    #[error("Failed to serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504, 508] {
            let err = ApiError::Status { status, body: json!({}) };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 422] {
            let err = ApiError::Status { status, body: json!({}) };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn tool_error_displays_bare_message() {
        let err = McpError::Tool("disk full".to_string());
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn tool_not_found_shape() {
        let err = McpError::ToolNotFound("read_file".to_string());
        assert_eq!(err.to_string(), "Tool not found: read_file");
    }
}
