// switchyard/src/hooks.rs
use async_trait::async_trait;
use serde_json::Value;

use crate::models::chat::ChatMessage;

/// What a hook wants the chat loop to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    /// Keep going with the current context.
    Continue,
    /// Keep going, replacing the context threaded to later hooks.
    Update(Value),
    /// Halt the loop immediately: remaining tool calls in the batch are
    /// abandoned and no further completion is requested.
    Stop,
    /// Halt like [`HookAction::Stop`], replacing the context first.
    StopWith(Value),
}

/// Outcome of a caller-provided tool executor.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomToolOutcome {
    /// The executor does not implement this tool; the loop falls back
    /// to MCP routing.
    NotFound,
    /// The tool ran; the value is normalized like an MCP result envelope.
    Success(Value),
    /// The tool ran and failed; the message becomes the tool result.
    Failure(String),
}

/// Capabilities a caller can hang off the chat loop.
///
/// Every method has a no-op default, so implementors override only what
/// they need. The context value is opaque to the core: it is whatever
/// the last hook returned, forwarded to the next hook.
#[async_trait]
pub trait ChatHooks: Send + Sync {
    /// Executes a tool the caller registered directly, ahead of MCP routing.
    async fn execute_custom_tool(
        &self,
        _name: &str,
        _arguments: &Value,
        _context: &Value,
    ) -> CustomToolOutcome {
        CustomToolOutcome::NotFound
    }

    /// Observes each assistant message, before any of its tool calls run.
    async fn on_assistant_message(&self, _message: &ChatMessage, _context: &Value) -> HookAction {
        HookAction::Continue
    }

    /// Observes each tool result, in dispatch order.
    async fn on_tool_result(
        &self,
        _tool_call_id: &str,
        _tool_name: &str,
        _result: &Value,
        _context: &Value,
    ) -> HookAction {
        HookAction::Continue
    }
}

/// The empty hook set.
pub struct NoopHooks;

#[async_trait]
impl ChatHooks for NoopHooks {}
