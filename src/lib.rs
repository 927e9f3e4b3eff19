// switchyard/src/lib.rs

//! Core of an agentic LLM orchestrator: a chat loop over an
//! OpenAI-compatible completions endpoint, a registry of MCP tool
//! sessions (stdio child processes and HTTP servers), and the retry
//! layer between them.
//!
//! The flow for one turn: [`ChatSession::chat`] POSTs the transcript
//! through [`CompletionClient`], executes whatever tool calls the model
//! emits (caller-registered custom tools first, then MCP sessions via
//! the [`SessionManager`]), appends the results, and loops until the
//! model answers without tools or a hook stops it.

pub mod api;
pub mod chat;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod mcp;

pub mod models {
    pub mod chat;
    pub mod tools;
}


pub use api::{CompletionClient, Sleeper, TokioSleeper};
pub use chat::{ChatRequest, ChatSession};
pub use config::{
    ClientConfig, HttpServerConfig, RuntimeConfig, ServerConfig, StdioServerConfig,
};
pub use errors::{ApiError, ChatError, McpError};
pub use hooks::{ChatHooks, CustomToolOutcome, HookAction, NoopHooks};
pub use mcp::manager::{SessionManager, SessionSummary, SessionTools, TransportFactory};
pub use mcp::{SessionStatus, Transport};
pub use models::chat::{ApiResponse, ChatMessage, ChatMetadata, Choice, MessageContent};
pub use models::tools::{format_tool_result, FunctionDecl, McpTool, ToolCall, ToolFunction};

pub use async_trait::async_trait;
