//! LLM provider adapters.
//!
//! Each provider implements [`LlmBackend`](crate::model::LlmBackend) for its
//! specific API.

mod anthropic;

pub use anthropic::{AnthropicBackend, AnthropicBackendBuilder, DEFAULT_MAX_TOKENS, DEFAULT_MODEL};
