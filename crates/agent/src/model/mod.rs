//! Provider-agnostic model types and the backend trait.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    ContentBlock, LlmBackend, ModelRequest, ModelResponse, Role, ToolCall, ToolOutcome, ToolSpec,
    Turn, Usage,
};
