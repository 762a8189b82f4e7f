use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured request from the model to run one tool.
///
/// Serializes to the chat-completions wire shape
/// (`{"id", "type": "function", "function": {"name", "arguments"}}`) while
/// keeping the raw JSON argument string untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        raw_arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }

    /// Build a call from already-parsed arguments.
    pub fn with_arguments(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self::new(id, name, arguments.to_string())
    }

    /// Parse the raw argument string. An empty string counts as `{}`.
    pub fn arguments(&self) -> serde_json::Result<Value> {
        if self.raw_arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.raw_arguments)
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default, deserialize_with = "arguments_as_string")]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

// Some providers send arguments as an object instead of a JSON string.
fn arguments_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(raw)) => raw,
        Some(other) => other.to_string(),
    })
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        Self {
            id: wire.id,
            name: wire.function.name,
            raw_arguments: wire.function.arguments,
        }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        Self {
            id: call.id,
            kind: function_kind(),
            function: WireFunction {
                name: call.name,
                arguments: call.raw_arguments,
            },
        }
    }
}

/// One entry of a conversation history.
///
/// An assistant message carries either `content` or `tool_calls`, and every
/// tool call is answered by exactly one `Role::Tool` message with the same
/// `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provider-specific reasoning trace, passed back verbatim on later rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<ToolCall>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ToolCall>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    fn bare(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            reasoning_details: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::bare(Role::System)
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::bare(Role::User)
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::bare(Role::Assistant)
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::bare(Role::Assistant)
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::bare(Role::Tool)
        }
    }

    pub fn with_reasoning_details(mut self, details: Option<Value>) -> Self {
        self.reasoning_details = details;
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Text content, or an empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}
