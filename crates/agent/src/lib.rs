//! Agent runtime: answers queries by letting a model call tools on MCP
//! backends.
//!
//! # Overview
//!
//! - **AgentLoop**: runs the model/tool exchange for one query under a
//!   round-trip budget.
//! - **Conversation**: the append-only transcript of one query.
//! - **SessionManager**: opens backend sessions and, under the persistent
//!   policy, keeps one per target across queries.
//! - **Dispatcher**: routes a query to a backend by logical name.
//! - **LlmBackend**: a trait abstracting model providers (Anthropic, etc.).
//!
//! # Example
//!
//! ```no_run
//! use agent::{Config, Dispatcher};
//!
//! # async fn example() -> agent::Result<()> {
//! let config = Config::load("agent.toml")?;
//! let dispatcher = Dispatcher::from_config(&config)?;
//!
//! let answer = dispatcher.query("weather", "Will it rain in Paris?").await?;
//! println!("{answer}");
//!
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod agent_loop;
mod config;
mod conversation;
mod dispatch;
mod error;
mod manager;
pub mod model;
pub mod providers;
mod tools;

#[cfg(test)]
mod testing;

pub use agent_loop::{
    AgentLoop, AgentOptions, Answer, DEFAULT_MAX_ROUND_TRIPS, DEFAULT_MODEL_TIMEOUT,
};
pub use config::{
    API_KEY_ENV, AgentConfig, BackendConfig, Config, ConfigError, Inject, ModelConfig,
    SecretConfig, SessionConfig,
};
pub use conversation::Conversation;
pub use dispatch::{BackendRegistry, Dispatcher};
pub use error::{Error, Result};
pub use manager::{ConnectionPolicy, Connector, Lease, SessionManager, StdioConnector};
pub use model::{
    ContentBlock, LlmBackend, ModelError, ModelRequest, ModelResponse, Role, ToolCall,
    ToolOutcome, ToolSpec, Turn, Usage,
};
pub use providers::{AnthropicBackend, AnthropicBackendBuilder};
pub use tools::{ToolSession, is_local_failure};
