//! Append-only transcript of one query.

use crate::model::{ToolCall, ToolOutcome, Turn};
use crate::{Error, Result};

/// The turns of one query, in order.
///
/// Turns are only ever appended. A tool result is accepted only when it
/// answers an earlier, still unanswered tool request with the same name.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Start a conversation with the user's query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::UserText { text: query.into() }],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::UserText { text: text.into() });
    }

    pub fn push_assistant_text(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::AssistantText { text: text.into() });
    }

    /// Record a tool request.
    ///
    /// A blank or already used id is replaced by a fresh one so results
    /// always correlate to exactly one request. Returns the call as
    /// recorded.
    pub fn push_tool_request(&mut self, mut call: ToolCall) -> ToolCall {
        if call.id.trim().is_empty() || self.request(&call.id).is_some() {
            call.id = format!("call_{}", self.turns.len());
        }
        self.turns.push(Turn::AssistantToolRequest(call.clone()));
        call
    }

    /// Record the result of an earlier tool request.
    pub fn push_tool_result(
        &mut self,
        request_id: &str,
        name: &str,
        outcome: ToolOutcome,
    ) -> Result<()> {
        let request = self.request(request_id).ok_or_else(|| {
            Error::Conversation(format!("no tool request with id {request_id}"))
        })?;
        if request.name != name {
            return Err(Error::Conversation(format!(
                "result for {name} answers request {request_id} for {}",
                request.name
            )));
        }
        if self.result(request_id).is_some() {
            return Err(Error::Conversation(format!(
                "tool request {request_id} already answered"
            )));
        }

        self.turns.push(Turn::ToolResult {
            request_id: request_id.to_string(),
            name: name.to_string(),
            outcome,
        });
        Ok(())
    }

    /// The tool request with this id, if any.
    pub fn request(&self, id: &str) -> Option<&ToolCall> {
        self.turns.iter().find_map(|turn| match turn {
            Turn::AssistantToolRequest(call) if call.id == id => Some(call),
            _ => None,
        })
    }

    fn result(&self, request_id: &str) -> Option<&ToolOutcome> {
        self.turns.iter().find_map(|turn| match turn {
            Turn::ToolResult {
                request_id: id,
                outcome,
                ..
            } if id == request_id => Some(outcome),
            _ => None,
        })
    }

    /// All assistant text so far, in order, newline-joined.
    pub fn assistant_text(&self) -> String {
        self.turns
            .iter()
            .filter_map(|turn| match turn {
                Turn::AssistantText { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
