// switchyard/src/models/chat.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::tools::ToolCall;

/// Message content: either a plain string or a sequence of strings,
/// which some callers produce and which normalizes to the
/// concatenation of its parts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<String>),
}

impl MessageContent {
    /// Collapses a part sequence into one string with no separator.
    pub fn flattened(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts.concat(),
        }
    }
}

/// A message in the chat history sent to/from the model.
/// Can represent system, user, assistant, or tool messages.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            ..Default::default()
        }
    }

    /// The message content as text, empty when absent.
    pub fn content_text(&self) -> String {
        self.content.as_ref().map(MessageContent::flattened).unwrap_or_default()
    }
}

/// One of the choices returned by the completion endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finish_reason: Option<String>,
    /// Some providers report upstream failures here inside a 200.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ProviderError>,
}

/// An error payload embedded in an otherwise successful response body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderError {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub message: String,
}

impl ProviderError {
    /// The reported code as an HTTP status, tolerating numeric strings.
    pub fn status_code(&self) -> Option<u16> {
        match self.code.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Bookkeeping the chat loop attaches to its final response.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatMetadata {
    pub tool_calls_made: Vec<ToolCall>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub stopped_by_hook: bool,
}

/// The overall structure of a completion response.
///
/// Unknown fields are carried in `extra` so the response the caller
/// receives is the response the endpoint sent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ProviderError>,
    #[serde(rename = "_metadata", skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<ChatMetadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiResponse {
    /// The first choice's message, where the assistant's turn lives.
    pub fn first_message(&self) -> Option<&ChatMessage> {
        self.choices.first().map(|c| &c.message)
    }
}
