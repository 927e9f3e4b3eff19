// switchyard/src/models/tools.rs
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::chat::{ChatMessage, MessageContent};

/// Represents a tool call requested by the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: ToolFunction,
}

/// The function call details within a [`ToolCall`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    /// Arguments as a JSON-encoded string. Endpoints omit the field or
    /// send `""` for zero-argument calls; both mean `{}`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub arguments: Option<String>,
}

fn function_call_type() -> String {
    "function".to_string()
}

/// The model asked for a tool with arguments that are not valid JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid_arguments")]
pub struct InvalidArguments;

impl ToolCall {
    /// Extracts `(name, arguments)` from the call.
    ///
    /// A missing or empty arguments string yields an empty object.
    pub fn extract(&self) -> Result<(String, Value), InvalidArguments> {
        let args = match self.function.arguments.as_deref() {
            None => Value::Object(Map::new()),
            Some(raw) if raw.trim().is_empty() => Value::Object(Map::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|_| InvalidArguments)?,
        };
        match args {
            Value::Object(_) => Ok((self.function.name.clone(), args)),
            _ => Err(InvalidArguments),
        }
    }
}

/// A tool schema in the external (OpenAI function) form sent to the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// A JSON-schema object with `properties` and `required`.
    pub parameters: Value,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters: normalize_parameters(parameters),
            },
        }
    }
}

/// A tool schema as advertised by an MCP server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default)]
    pub input_schema: Value,
}

impl McpTool {
    /// Converts the MCP schema into the external function form.
    ///
    /// Lossless for `name`, `description`, `properties` and `required`;
    /// `required` defaults to `[]` and `properties` to `{}` when the
    /// server omits them.
    pub fn to_function_decl(&self) -> FunctionDecl {
        FunctionDecl::new(
            self.name.clone(),
            self.description.clone(),
            self.input_schema.clone(),
        )
    }
}

/// Fills in the parts of an object schema the model side requires.
fn normalize_parameters(schema: Value) -> Value {
    let mut map = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.entry("type").or_insert_with(|| json!("object"));
    map.entry("properties").or_insert_with(|| json!({}));
    map.entry("required").or_insert_with(|| json!([]));
    Value::Object(map)
}

/// Builds the tool-role message answering one tool call.
///
/// Accepts the envelope shapes MCP servers actually produce: a wrapped
/// content list, a wrapped content string, a bare content list (seen in
/// non-compliant servers), or anything else, which is preserved by
/// JSON-encoding. A recognizable content list becomes the newline-join
/// of its text items, never a JSON-encoded array.
pub fn format_tool_result(tool_call_id: &str, result: &Value) -> ChatMessage {
    let content = render_result(result);
    ChatMessage {
        role: "tool".to_string(),
        content: Some(MessageContent::Text(content)),
        tool_calls: None,
        tool_call_id: Some(tool_call_id.to_string()),
    }
}

fn render_result(result: &Value) -> String {
    match result {
        Value::Object(map) => match map.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(items)) => render_content_list(items),
            Some(other) => other.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        Value::Array(items) => render_content_list(items),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_content_list(items: &[Value]) -> String {
    let recognized = !items.is_empty() && items.iter().all(is_content_item);
    if recognized {
        items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        Value::Array(items.to_vec()).to_string()
    }
}

/// An item is MCP-shaped when it carries a `type` or `text` attribute.
fn is_content_item(item: &Value) -> bool {
    item.get("type").is_some() || item.get("text").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(arguments: Option<&str>) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: "read_file".to_string(),
                arguments: arguments.map(|s| s.to_string()),
            },
        }
    }

    #[test]
    fn extract_missing_arguments_yields_empty_object() {
        let (name, args) = call(None).extract().unwrap();
        assert_eq!(name, "read_file");
        assert_eq!(args, json!({}));
    }

    #[test]
    fn extract_empty_arguments_yields_empty_object() {
        let (_, args) = call(Some("")).extract().unwrap();
        assert_eq!(args, json!({}));
    }

    #[test]
    fn extract_parses_arguments() {
        let (_, args) = call(Some(r#"{"path":"/a"}"#)).extract().unwrap();
        assert_eq!(args, json!({"path": "/a"}));
    }

    #[test]
    fn extract_rejects_invalid_json() {
        assert_eq!(call(Some("{not json")).extract(), Err(InvalidArguments));
    }

    #[test]
    fn tool_call_round_trips_through_json() {
        let value = json!({
            "id": "c9",
            "type": "function",
            "function": { "name": "shell", "arguments": "{\"cmd\":\"ls\"}" }
        });
        let parsed: ToolCall = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&parsed).unwrap(), value);
    }

    #[test]
    fn conversion_preserves_schema_fields() {
        let tool = McpTool {
            name: "read_file".to_string(),
            description: "Reads a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        };
        let decl = tool.to_function_decl();
        assert_eq!(decl.kind, "function");
        assert_eq!(decl.function.name, "read_file");
        assert_eq!(decl.function.description, "Reads a file");
        assert_eq!(
            decl.function.parameters["properties"]["path"]["type"],
            json!("string")
        );
        assert_eq!(decl.function.parameters["required"], json!(["path"]));
    }

    #[test]
    fn conversion_defaults_required_and_properties() {
        let tool = McpTool {
            name: "ping".to_string(),
            description: String::new(),
            input_schema: json!({ "type": "object" }),
        };
        let decl = tool.to_function_decl();
        assert_eq!(decl.function.parameters["properties"], json!({}));
        assert_eq!(decl.function.parameters["required"], json!([]));
    }

    #[test]
    fn format_wrapped_content_list() {
        let result = json!({ "content": [{ "type": "text", "text": "contents" }] });
        let msg = format_tool_result("c1", &result);
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msg.content, Some(MessageContent::Text("contents".into())));
    }

    #[test]
    fn format_wrapped_content_string() {
        let result = json!({ "content": "plain text" });
        let msg = format_tool_result("c1", &result);
        assert_eq!(msg.content, Some(MessageContent::Text("plain text".into())));
    }

    #[test]
    fn format_bare_content_list_joins_text_items() {
        // Non-compliant servers return the list without the wrapper.
        let result = json!([
            { "type": "text", "text": "L1" },
            { "type": "text", "text": "L2" }
        ]);
        let msg = format_tool_result("c1", &result);
        assert_eq!(msg.content, Some(MessageContent::Text("L1\nL2".into())));
    }

    #[test]
    fn format_unrecognized_object_is_json_encoded() {
        let result = json!({ "rows": 3 });
        let msg = format_tool_result("c1", &result);
        assert_eq!(
            msg.content,
            Some(MessageContent::Text(r#"{"rows":3}"#.into()))
        );
    }

    #[test]
    fn format_unrecognized_list_is_json_encoded() {
        let result = json!([1, 2, 3]);
        let msg = format_tool_result("c1", &result);
        assert_eq!(msg.content, Some(MessageContent::Text("[1,2,3]".into())));
    }
}
