//! The boundary between the agent loop and tool backends.

use std::future::Future;
use std::sync::Arc;

use mcp::{CallToolResult, Session, ToolDescriptor};
use serde_json::{Map, Value};

/// A ready connection to one tool backend.
///
/// Implemented by [`mcp::Session`]; tests substitute in-memory hosts.
pub trait ToolSession: Send + Sync {
    /// Whether RPCs may still be issued.
    fn is_ready(&self) -> bool;

    /// The backend's tool catalog.
    fn list_tools(&self) -> impl Future<Output = mcp::Result<Arc<[ToolDescriptor]>>> + Send;

    /// Execute one tool.
    fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> impl Future<Output = mcp::Result<CallToolResult>> + Send;

    /// Tear the connection down. Idempotent, never fails.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl ToolSession for Session {
    fn is_ready(&self) -> bool {
        Session::is_ready(self)
    }

    async fn list_tools(&self) -> mcp::Result<Arc<[ToolDescriptor]>> {
        Session::list_tools(self).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> mcp::Result<CallToolResult> {
        Session::call_tool(self, name, arguments).await
    }

    async fn close(&self) {
        Session::close(self).await
    }
}

/// Whether a tool-call failure stays local to that call.
///
/// Local failures are reported to the model as a tool result; anything
/// else means the session itself is unusable and the query aborts.
pub fn is_local_failure(error: &mcp::Error) -> bool {
    matches!(
        error,
        mcp::Error::ToolNotFound(_)
            | mcp::Error::ToolExecution(_)
            | mcp::Error::Timeout { .. }
            | mcp::Error::Rpc(_)
            | mcp::Error::InvalidResponse(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn local_and_fatal_failures() {
        assert!(is_local_failure(&mcp::Error::ToolNotFound("x".into())));
        assert!(is_local_failure(&mcp::Error::Timeout {
            method: "tools/call".into(),
            after: Duration::from_secs(1),
        }));
        assert!(is_local_failure(&mcp::Error::Rpc("[-32603] internal".into())));
        assert!(!is_local_failure(&mcp::Error::Transport("eof".into())));
        assert!(!is_local_failure(&mcp::Error::NotReady(
            mcp::SessionState::Closed
        )));
    }
}
