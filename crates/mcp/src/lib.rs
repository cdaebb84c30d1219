//! MCP (Model Context Protocol) client library.
//!
//! This crate provides sessions with tool backends that speak MCP over a
//! child process's stdio, using the `rmcp` client service.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{BackendTarget, Secret, Session, SessionOptions};
//!
//! # async fn example() -> mcp::Result<()> {
//! let target = BackendTarget::script("servers/github/dist/index.js")?
//!     .secret(Secret::env("GITHUB_PAT", "ghp_..."));
//!
//! let session = Session::open(target, SessionOptions::default()).await?;
//!
//! for tool in session.list_tools().await?.iter() {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let args = serde_json::json!({"owner": "facebook", "repo": "react"});
//! let result = session
//!     .call_tool("list_releases", args.as_object().cloned())
//!     .await?;
//! println!("{}", result.text());
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod limit;
mod protocol;
mod session;
mod stderr;
mod target;

pub use error::{Error, Result};
pub use limit::MAX_LINE_LENGTH;
pub use protocol::{
    CallToolResult, InitializeResult, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, ServerInfo,
    ToolContent, ToolDescriptor, ToolsCapability,
};
pub use session::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, Session,
    SessionOptions, SessionState,
};
pub use target::{BackendTarget, Secret, SecretInjection, ServiceKind, interpreter_for};
