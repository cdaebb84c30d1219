//! MCP payload types as this crate exposes them.
//!
//! Framing, request ids and the handshake exchange are handled by `rmcp`;
//! these types are the decoded shapes the rest of the workspace works
//! with, read from rmcp's model through their wire form.

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Protocol revisions this client accepts from a server, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

/// Re-read an rmcp model value as one of our types.
pub(crate) fn decode<T: DeserializeOwned>(what: &str, value: &impl Serialize) -> Result<T> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::InvalidResponse(format!("{what}: {e}")))
}

fn null_as_false<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Option::<bool>::deserialize(d).map(Option::unwrap_or_default)
}

/// MCP initialize response result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Server capabilities returned during initialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<ToolsCapability>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default, deserialize_with = "null_as_false")]
    pub list_changed: bool,
}

/// Server info returned during initialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A tool definition returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Description text, empty when the server sent none.
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text of all content blocks, one per line.
    ///
    /// Non-text blocks are rendered as their JSON form.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text(text) => text.clone(),
                other => Value::from(other.clone()).to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content returned by a tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(from = "Value", into = "Value")]
pub enum ToolContent {
    Text(String),
    Image { data: String, mime_type: String },
    Audio { data: String, mime_type: String },
    Resource(Value),
    /// A block of any other shape, kept verbatim.
    Other(Value),
}

impl ToolContent {
    /// Get text content if this is a text content block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<Value> for ToolContent {
    fn from(raw: Value) -> Self {
        let field = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_string);
        let media = || Some((field("data")?, field("mimeType")?));
        let decoded = match raw.get("type").and_then(Value::as_str) {
            Some("text") => field("text").map(Self::Text),
            Some("image") => media().map(|(data, mime_type)| Self::Image { data, mime_type }),
            Some("audio") => media().map(|(data, mime_type)| Self::Audio { data, mime_type }),
            Some("resource") => raw.get("resource").cloned().map(Self::Resource),
            _ => None,
        };
        decoded.unwrap_or(Self::Other(raw))
    }
}

impl From<ToolContent> for Value {
    fn from(content: ToolContent) -> Self {
        match content {
            ToolContent::Text(text) => json!({"type": "text", "text": text}),
            ToolContent::Image { data, mime_type } => {
                json!({"type": "image", "data": data, "mimeType": mime_type})
            }
            ToolContent::Audio { data, mime_type } => {
                json!({"type": "audio", "data": data, "mimeType": mime_type})
            }
            ToolContent::Resource(resource) => json!({"type": "resource", "resource": resource}),
            ToolContent::Other(raw) => raw,
        }
    }
}
