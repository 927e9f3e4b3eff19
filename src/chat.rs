// switchyard/src/chat.rs

//! The conversation driver: issues completion requests, dispatches the
//! tool calls the model asks for, threads the results back into the
//! transcript, and loops until the model produces a terminal answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::api::CompletionClient;
use crate::errors::ChatError;
use crate::hooks::{ChatHooks, CustomToolOutcome, HookAction, NoopHooks};
use crate::mcp::manager::SessionManager;
use crate::models::chat::{ApiResponse, ChatMessage, ChatMetadata, MessageContent};
use crate::models::tools::{format_tool_result, FunctionDecl, ToolCall};

/// One chat invocation: the model, the conversation so far, and the
/// knobs forwarded to the endpoint.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    /// When false, a response carrying tool calls is returned unchanged
    /// without executing anything or invoking hooks.
    pub execute_tools: bool,
    /// Opaque value threaded through hooks.
    pub context: Value,
    pub temperature: Option<f64>,
    pub parallel_tool_calls: Option<bool>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            execute_tools: true,
            context: json!({}),
            temperature: None,
            parallel_tool_calls: None,
        }
    }
}

/// A conversation surface wired to one completion client, the MCP
/// session pool, and the caller's custom tools and hooks.
///
/// Immutable after construction except for the tool routing table,
/// which [`ChatSession::rebuild_routing`] refreshes from the manager.
pub struct ChatSession {
    client: CompletionClient,
    manager: Option<SessionManager>,
    custom_tools: Vec<FunctionDecl>,
    rejected_tools: HashSet<String>,
    tool_routing: HashMap<String, String>,
    hooks: Arc<dyn ChatHooks>,
}

impl ChatSession {
    /// Builds the session and its routing table eagerly.
    pub async fn new(
        client: CompletionClient,
        manager: Option<SessionManager>,
        custom_tools: Vec<FunctionDecl>,
        rejected_tools: HashSet<String>,
        hooks: Option<Arc<dyn ChatHooks>>,
    ) -> Self {
        let mut session = Self {
            client,
            manager,
            custom_tools,
            rejected_tools,
            tool_routing: HashMap::new(),
            hooks: hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
        };
        session.rebuild_routing().await;
        session
    }

    /// Rebuilds the tool-name → session-id routing table from the
    /// connected sessions. First advertiser wins, in session insertion
    /// order.
    pub async fn rebuild_routing(&mut self) {
        let Some(manager) = &self.manager else { return };
        match manager.list_raw_tools().await {
            Ok(raw) => {
                let mut routing = HashMap::new();
                for session in raw {
                    for tool in session.tools {
                        if self.rejected_tools.contains(&tool.name) {
                            continue;
                        }
                        routing
                            .entry(tool.name)
                            .or_insert_with(|| session.session_id.clone());
                    }
                }
                debug!(tools = routing.len(), "Rebuilt tool routing table");
                self.tool_routing = routing;
            }
            Err(e) => warn!(error = %e, "Failed to rebuild tool routing table"),
        }
    }

    /// Tools offered to the model: everything the connected sessions
    /// advertise minus the rejected names, then the custom tools.
    async fn available_tools(&self) -> Vec<FunctionDecl> {
        let mut tools = Vec::new();
        if let Some(manager) = &self.manager {
            match manager.get_all_tools().await {
                Ok(mcp_tools) => tools.extend(
                    mcp_tools
                        .into_iter()
                        .filter(|t| !self.rejected_tools.contains(&t.function.name)),
                ),
                Err(e) => warn!(error = %e, "Failed to aggregate MCP tools"),
            }
        }
        tools.extend(
            self.custom_tools
                .iter()
                .filter(|t| !self.rejected_tools.contains(&t.function.name))
                .cloned(),
        );
        tools
    }

    /// Drives the conversation until the model stops asking for tools,
    /// a hook stops it, or the endpoint fails.
    pub async fn chat(&self, request: ChatRequest) -> Result<ApiResponse, ChatError> {
        let mut transcript: Vec<ChatMessage> = Vec::new();
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            transcript.push(ChatMessage::text("system", prompt));
        }
        transcript.extend(request.messages.iter().map(normalize_message));

        let tools = self.available_tools().await;
        let mut context = request.context.clone();
        let mut calls_made: Vec<ToolCall> = Vec::new();

        loop {
            let body = build_body(&request, &transcript, &tools)?;
            let mut response = self.client.chat_completion(&body).await.map_err(ChatError::Api)?;
            let message = response
                .first_message()
                .cloned()
                .ok_or(ChatError::NoChoices)?;
            let tool_calls = message.tool_calls.clone().unwrap_or_default();

            if tool_calls.is_empty() {
                let action = self.hooks.on_assistant_message(&message, &context).await;
                let stopped = matches!(action, HookAction::Stop | HookAction::StopWith(_));
                attach_metadata(&mut response, calls_made, stopped);
                info!("Chat turn complete");
                return Ok(response);
            }

            if !request.execute_tools {
                debug!(count = tool_calls.len(), "Returning tool calls unexecuted");
                return Ok(response);
            }

            // The message hook runs before execution so downstream
            // persistence sees the request before its results.
            match self.hooks.on_assistant_message(&message, &context).await {
                HookAction::Continue => {}
                HookAction::Update(new_context) => context = new_context,
                HookAction::Stop | HookAction::StopWith(_) => {
                    warn!("Hook stopped the loop before tool execution");
                    attach_metadata(&mut response, calls_made, true);
                    return Ok(response);
                }
            }

            let mut results: Vec<ChatMessage> = Vec::new();
            let mut stopped = false;
            for call in &tool_calls {
                let name = call.function.name.clone();
                let raw = match call.extract() {
                    Err(_) => {
                        warn!(tool = %name, "Tool call arguments were not valid JSON");
                        json!({ "error": "invalid_arguments" })
                    }
                    Ok((_, arguments)) => self.dispatch_tool(&name, arguments, &context).await,
                };
                results.push(format_tool_result(&call.id, &raw));
                calls_made.push(call.clone());

                match self
                    .hooks
                    .on_tool_result(&call.id, &name, &raw, &context)
                    .await
                {
                    HookAction::Continue => {}
                    HookAction::Update(new_context) => context = new_context,
                    HookAction::Stop => stopped = true,
                    HookAction::StopWith(new_context) => {
                        context = new_context;
                        stopped = true;
                    }
                }
                if stopped {
                    warn!(executed = results.len(), total = tool_calls.len(), "Hook stopped the loop mid-batch");
                    break;
                }
            }

            if stopped {
                attach_metadata(&mut response, calls_made, true);
                return Ok(response);
            }

            transcript.push(normalize_assistant_message(&message));
            transcript.extend(results);
        }
    }

    /// Classifies and executes one tool call. Custom tools run first;
    /// an executor that does not know the name falls back to MCP
    /// routing. Failures become the result the model reads, never an
    /// abort.
    async fn dispatch_tool(&self, name: &str, arguments: Value, context: &Value) -> Value {
        let is_custom = self.custom_tools.iter().any(|t| t.function.name == name);
        let is_routed = self.tool_routing.contains_key(name);

        if is_custom {
            match self
                .hooks
                .execute_custom_tool(name, &arguments, context)
                .await
            {
                CustomToolOutcome::Success(value) => return value,
                CustomToolOutcome::Failure(message) => {
                    warn!(tool = %name, error = %message, "Custom tool failed");
                    return json!({ "error": message });
                }
                CustomToolOutcome::NotFound => {
                    debug!(tool = %name, "Custom executor declined, trying MCP routing");
                }
            }
        } else if !is_routed {
            return Value::String(format!("Tool not available: {name}"));
        }

        match (&self.manager, is_routed) {
            (Some(manager), true) => match manager.call_tool(name, arguments).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %name, error = %e, "Tool execution failed");
                    json!({ "error": e.to_string() })
                }
            },
            _ => Value::String(format!("Tool not available: {name}")),
        }
    }
}

/// Input normalization: a content part sequence collapses to its
/// concatenation.
fn normalize_message(message: &ChatMessage) -> ChatMessage {
    let mut normalized = message.clone();
    if let Some(MessageContent::Parts(_)) = &normalized.content {
        normalized.content = Some(MessageContent::Text(message.content_text()));
    }
    normalized
}

/// The transcript copy of an assistant message carrying tool calls:
/// content defaults to `""` and every `function.arguments` to `"{}"`,
/// since some endpoints reject the message otherwise.
fn normalize_assistant_message(message: &ChatMessage) -> ChatMessage {
    let mut normalized = message.clone();
    if normalized.content.is_none() {
        normalized.content = Some(MessageContent::Text(String::new()));
    }
    if let Some(tool_calls) = &mut normalized.tool_calls {
        for call in tool_calls {
            if call.function.arguments.is_none() {
                call.function.arguments = Some("{}".to_string());
            }
        }
    }
    normalized
}

/// Request body: `messages` and `model` always, optional fields only
/// when supplied, `tools` only when non-empty.
fn build_body(
    request: &ChatRequest,
    transcript: &[ChatMessage],
    tools: &[FunctionDecl],
) -> Result<Value, ChatError> {
    let mut body = Map::new();
    body.insert("messages".to_string(), serde_json::to_value(transcript)?);
    body.insert("model".to_string(), json!(request.model));
    if !tools.is_empty() {
        body.insert("tools".to_string(), serde_json::to_value(tools)?);
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(parallel) = request.parallel_tool_calls {
        body.insert("parallel_tool_calls".to_string(), json!(parallel));
    }
    Ok(Value::Object(body))
}

fn attach_metadata(response: &mut ApiResponse, calls_made: Vec<ToolCall>, stopped_by_hook: bool) {
    if calls_made.is_empty() && !stopped_by_hook {
        return;
    }
    response.metadata = Some(ChatMetadata {
        tool_calls_made: calls_made,
        stopped_by_hook,
    });
}
