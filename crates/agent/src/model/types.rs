//! Core LLM types (provider-agnostic).
//!
//! These types represent the universal concepts shared across LLM providers.
//! Provider-specific details belong in adapter modules.

use std::future::Future;
use std::ops::AddAssign;

use mcp::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ModelError;

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier used to correlate the result.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as the model produced them.
    pub input: Value,
}

/// Outcome of a tool execution, as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { output: String },
    Error { message: String },
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success {
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The text handed back to the model either way.
    pub fn content(&self) -> &str {
        match self {
            Self::Success { output } => output,
            Self::Error { message } => message,
        }
    }
}

/// One entry of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    UserText { text: String },
    AssistantText { text: String },
    AssistantToolRequest(ToolCall),
    ToolResult {
        request_id: String,
        name: String,
        outcome: ToolOutcome,
    },
}

impl Turn {
    /// Which side of the exchange produced this turn.
    pub fn role(&self) -> Role {
        match self {
            Self::UserText { .. } | Self::ToolResult { .. } => Role::User,
            Self::AssistantText { .. } | Self::AssistantToolRequest(_) => Role::Assistant,
        }
    }
}

/// One block of a model response, decoded into a closed set of shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolCall),
    /// Anything else the provider sent; carries its type tag.
    Unrecognized { kind: String },
}

impl ContentBlock {
    /// Decode one raw provider block.
    ///
    /// Blocks whose tag is known but whose fields are missing or mistyped
    /// also decode as `Unrecognized` rather than failing the response.
    pub fn decode(raw: &Value) -> Self {
        let kind = raw.get("type").and_then(Value::as_str);
        let field = |name: &str| raw.get(name).and_then(Value::as_str);
        match kind {
            Some("text") => match field("text") {
                Some(text) => Self::Text(text.to_string()),
                None => Self::unrecognized("text"),
            },
            Some("tool_use") => match (field("id"), field("name")) {
                (Some(id), Some(name)) => Self::ToolUse(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: raw.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => Self::unrecognized("tool_use"),
            },
            Some(other) => Self::unrecognized(other),
            None => Self::unrecognized("untyped"),
        }
    }

    fn unrecognized(kind: &str) -> Self {
        Self::Unrecognized {
            kind: kind.to_string(),
        }
    }
}

/// Tool specification exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl From<&ToolDescriptor> for ToolSpec {
    fn from(tool: &ToolDescriptor) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Everything needed for a model request.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub turns: &'a [Turn],
    pub tools: &'a [ToolSpec],
}

/// The response from a model: content blocks in the order produced.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub blocks: Vec<ContentBlock>,
    pub usage: Usage,
}

/// Trait for LLM provider backends.
pub trait LlmBackend: Send + Sync {
    fn complete(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<ModelResponse, ModelError>> + Send;
}
