use thiserror::Error;

use crate::config::ConfigError;
use crate::model::ModelError;

/// Failures surfaced to the caller of a query.
///
/// Tool-level failures never appear here; they are handed back to the
/// model as tool results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend session could not be opened or broke mid-query.
    #[error(transparent)]
    Session(#[from] mcp::Error),

    /// The model provider failed. `partial` holds the assistant text
    /// produced before the failure; it is not a complete answer.
    #[error("model provider failed: {source}")]
    Model {
        #[source]
        source: ModelError,
        partial: Option<String>,
    },

    #[error("loop budget exceeded: model still requesting tools after {max_round_trips} round-trips")]
    LoopBudgetExceeded { max_round_trips: usize },

    #[error("query cancelled")]
    Cancelled,

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// A tool result did not answer a pending tool request.
    #[error("conversation integrity: {0}")]
    Conversation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
