//! The model/tool exchange for one query.

use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::model::{
    ContentBlock, LlmBackend, ModelError, ModelRequest, ModelResponse, ToolCall, ToolOutcome,
    ToolSpec, Usage,
};
use crate::tools::{ToolSession, is_local_failure};
use crate::{Error, Result};

pub const DEFAULT_MAX_ROUND_TRIPS: usize = 10;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOptions {
    /// Maximum model calls per query.
    pub max_round_trips: usize,
    /// Bound on each model call.
    pub model_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_round_trips: DEFAULT_MAX_ROUND_TRIPS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// The final answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Assistant text from every round, newline-joined.
    pub text: String,
    pub round_trips: usize,
    pub tool_calls: usize,
    pub usage: Usage,
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Drives a model against one tool session until it stops asking for
/// tools.
///
/// Each call to [`run`](Self::run) owns a fresh [`Conversation`]; the loop
/// itself holds no per-query state, so one `AgentLoop` can serve
/// concurrent queries.
pub struct AgentLoop<B> {
    backend: B,
    options: AgentOptions,
}

impl<B: LlmBackend> AgentLoop<B> {
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, AgentOptions::default())
    }

    pub fn with_options(backend: B, options: AgentOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Answer `query` using the tools of `session`.
    ///
    /// Tool failures go back to the model as error results. Session
    /// failures, model failures, cancellation and an exhausted round-trip
    /// budget end the query with an error.
    pub async fn run<S: ToolSession>(
        &self,
        session: &S,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        check_cancelled(cancel)?;
        let catalog = session.list_tools().await?;
        let tools: Vec<ToolSpec> = catalog.iter().map(ToolSpec::from).collect();

        let mut conversation = Conversation::new(query);
        let mut usage = Usage::default();
        let mut tool_calls = 0;

        for round in 1..=self.options.max_round_trips {
            check_cancelled(cancel)?;
            let response = self.complete(&conversation, &tools).await?;
            usage += response.usage;

            // Blocks are handled in reply order; every tool request runs
            // before the next model call.
            let mut requested = 0;
            for block in response.blocks {
                match block {
                    ContentBlock::Text(text) if text.is_empty() => {}
                    ContentBlock::Text(text) => conversation.push_assistant_text(text),
                    ContentBlock::ToolUse(call) => {
                        check_cancelled(cancel)?;
                        let call = conversation.push_tool_request(call);
                        tracing::debug!(round, tool = %call.name, id = %call.id, "executing tool");
                        let outcome = execute(session, &call).await?;
                        conversation.push_tool_result(&call.id, &call.name, outcome)?;
                        requested += 1;
                    }
                    ContentBlock::Unrecognized { kind } => {
                        tracing::warn!(round, kind = %kind, "skipping unrecognized content block");
                    }
                }
            }
            tool_calls += requested;

            if requested == 0 {
                tracing::debug!(round, tool_calls, "model finished");
                return Ok(Answer {
                    text: conversation.assistant_text(),
                    round_trips: round,
                    tool_calls,
                    usage,
                });
            }
        }

        tracing::warn!(
            max_round_trips = self.options.max_round_trips,
            "model kept requesting tools"
        );
        Err(Error::LoopBudgetExceeded {
            max_round_trips: self.options.max_round_trips,
        })
    }

    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
    ) -> Result<ModelResponse> {
        let request = ModelRequest {
            turns: conversation.turns(),
            tools,
        };
        let failure = match timeout(self.options.model_timeout, self.backend.complete(request)).await
        {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_) => ModelError::Timeout(self.options.model_timeout),
        };

        let partial = conversation.assistant_text();
        Err(Error::Model {
            source: failure,
            partial: (!partial.is_empty()).then_some(partial),
        })
    }
}

/// Run one tool call. Only session-level failures are returned as errors.
async fn execute<S: ToolSession>(session: &S, call: &ToolCall) -> Result<ToolOutcome> {
    let arguments = match &call.input {
        Value::Object(map) => Some(map.clone()),
        Value::Null => None,
        other => {
            return Ok(ToolOutcome::error(format!(
                "arguments for {} must be a JSON object, got {other}",
                call.name
            )));
        }
    };

    match session.call_tool(&call.name, arguments).await {
        Ok(result) => Ok(ToolOutcome::success(result.text())),
        Err(e) if is_local_failure(&e) => {
            tracing::debug!(tool = %call.name, error = %e, "tool failed");
            Ok(ToolOutcome::error(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
