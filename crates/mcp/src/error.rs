//! MCP error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionState;
use thiserror::Error;

/// Errors from backend sessions.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer did not acknowledge `initialize`, or speaks an
    /// incompatible protocol revision.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An RPC was attempted outside the `Ready` state.
    #[error("session is {0}, not ready")]
    NotReady(SessionState),

    /// The tool is absent from the session's catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The backend reported a failure while running the tool.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// The byte stream to the backend broke; the session is closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response to an RPC within the configured bound.
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The script extension does not map to a known interpreter.
    #[error("no interpreter known for {}", .0.display())]
    UnsupportedScript(PathBuf),

    /// The backend answered with an MCP error response.
    #[error("backend error: {0}")]
    Rpc(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Whether this error means the stream itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
