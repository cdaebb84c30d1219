//! Configuration loading from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcp::{BackendTarget, Secret, SecretInjection, ServiceKind, SessionOptions, interpreter_for};
use serde::Deserialize;

use crate::agent_loop::{AgentOptions, DEFAULT_MAX_ROUND_TRIPS, DEFAULT_MODEL_TIMEOUT};
use crate::dispatch::BackendRegistry;
use crate::manager::ConnectionPolicy;
use crate::providers::{AnthropicBackend, DEFAULT_MAX_TOKENS, DEFAULT_MODEL};

/// Environment variable consulted when `model.api_key` is unset.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Backends by logical name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

/// Model provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Anthropic API key. Falls back to `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,

    /// System prompt sent with every request.
    pub system: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            api_key: None,
            system: None,
        }
    }
}

/// Agent loop bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: usize,

    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_round_trips: default_max_round_trips(),
            model_timeout_secs: default_model_timeout_secs(),
        }
    }
}

/// Session lifetime and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub policy: ConnectionPolicy,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ConnectionPolicy::default(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// How to launch one backend.
///
/// Exactly one of `script` or `command` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Script path; the interpreter follows from its extension unless
    /// `interpreter` is given.
    pub script: Option<PathBuf>,
    pub interpreter: Option<PathBuf>,

    /// Executable to run directly.
    pub command: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Overlay on the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub cwd: Option<PathBuf>,

    pub secret: Option<SecretConfig>,
}

/// A credential for one backend.
#[derive(Clone, Deserialize)]
pub struct SecretConfig {
    pub value: String,

    /// Variable name. Required unless `service` names a known service.
    pub name: Option<String>,

    /// `github`, `postgres`, `redis` or `sentry`.
    pub service: Option<String>,

    /// Defaults to `argument` for JavaScript scripts and `env` otherwise.
    pub inject: Option<Inject>,
}

impl std::fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConfig")
            .field("value", &"***")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("inject", &self.inject)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inject {
    Env,
    Argument,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_round_trips() -> usize {
    DEFAULT_MAX_ROUND_TRIPS
}

fn default_model_timeout_secs() -> u64 {
    DEFAULT_MODEL_TIMEOUT.as_secs()
}

fn default_handshake_timeout_secs() -> u64 {
    mcp::DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_request_timeout_secs() -> u64 {
    mcp::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_shutdown_timeout_secs() -> u64 {
    mcp::DEFAULT_SHUTDOWN_TIMEOUT.as_secs()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the backend registry. Fails on the first invalid backend.
    pub fn registry(&self) -> Result<BackendRegistry, ConfigError> {
        let mut registry = BackendRegistry::new();
        for (name, backend) in &self.backends {
            registry.register(name.clone(), backend.target(name)?);
        }
        Ok(registry)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            request_timeout: Duration::from_secs(self.session.request_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.session.shutdown_timeout_secs),
        }
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            max_round_trips: self.agent.max_round_trips,
            model_timeout: Duration::from_secs(self.agent.model_timeout_secs),
        }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.session.policy
    }

    /// Build the Anthropic backend.
    ///
    /// Requires `model.api_key` or the `ANTHROPIC_API_KEY` variable.
    pub fn anthropic(&self) -> Result<AnthropicBackend, ConfigError> {
        let api_key = self.api_key(std::env::var(API_KEY_ENV).ok())?;
        let mut builder = AnthropicBackend::builder(api_key, &self.model.model)
            .max_tokens(self.model.max_tokens);
        if let Some(system) = &self.model.system {
            builder = builder.system(system);
        }
        Ok(builder.build())
    }

    fn api_key(&self, from_env: Option<String>) -> Result<String, ConfigError> {
        self.model
            .api_key
            .clone()
            .or(from_env)
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

impl BackendConfig {
    /// Resolve into a launchable target. `name` is only used in errors.
    pub fn target(&self, name: &str) -> Result<BackendTarget, ConfigError> {
        let invalid = |reason: String| ConfigError::Backend {
            name: name.to_string(),
            reason,
        };

        let mut target = match (&self.script, &self.command) {
            (Some(script), None) => match &self.interpreter {
                Some(interpreter) => BackendTarget::script_with(interpreter, script),
                None => BackendTarget::script(script).map_err(|e| invalid(e.to_string()))?,
            },
            (None, Some(command)) => BackendTarget::new(command),
            (Some(_), Some(_)) => {
                return Err(invalid("set either script or command, not both".into()));
            }
            (None, None) => return Err(invalid("missing script or command".into())),
        };

        if let Some(secret) = &self.secret {
            target = target.secret(self.resolve_secret(secret).map_err(invalid)?);
        }

        target = target.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            target = target.current_dir(cwd);
        }
        Ok(target)
    }

    fn resolve_secret(&self, secret: &SecretConfig) -> Result<Secret, String> {
        let name = match (&secret.name, &secret.service) {
            (Some(name), _) => name.clone(),
            (None, Some(service)) => service.parse::<ServiceKind>()?.env_name().to_string(),
            (None, None) => return Err("secret needs a name or a service".into()),
        };

        let runs_on_node = self.interpreter.is_none()
            && self
                .script
                .as_deref()
                .and_then(interpreter_for)
                .is_some_and(|interpreter| interpreter == "node");
        let injection = match secret.inject {
            Some(Inject::Env) => SecretInjection::Env,
            Some(Inject::Argument) => SecretInjection::Argument,
            None if runs_on_node => SecretInjection::Argument,
            None => SecretInjection::Env,
        };

        Ok(Secret {
            name,
            value: secret.value.clone(),
            injection,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("API key not configured: set model.api_key or ANTHROPIC_API_KEY")]
    MissingApiKey,

    #[error("backend '{name}': {reason}")]
    Backend { name: String, reason: String },
}
