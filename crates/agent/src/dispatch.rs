//! Routing queries to backends by logical name.

use std::collections::HashMap;

use mcp::BackendTarget;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{AgentLoop, Answer};
use crate::config::Config;
use crate::manager::{ConnectionPolicy, Connector, SessionManager, StdioConnector};
use crate::model::LlmBackend;
use crate::providers::AnthropicBackend;
use crate::{Error, Result};

/// Logical backend names and how to launch them.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    targets: HashMap<String, BackendTarget>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` under `name`, replacing any earlier entry.
    pub fn register(&mut self, name: impl Into<String>, target: BackendTarget) {
        self.targets.insert(name.into(), target);
    }

    pub fn get(&self, name: &str) -> Option<&BackendTarget> {
        self.targets.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Answers queries against named backends.
///
/// Sessions come from a [`SessionManager`] under the dispatcher's default
/// [`ConnectionPolicy`], which single queries may override.
pub struct Dispatcher<B, C: Connector> {
    registry: BackendRegistry,
    manager: SessionManager<C>,
    agent: AgentLoop<B>,
    policy: ConnectionPolicy,
}

impl Dispatcher<AnthropicBackend, StdioConnector> {
    /// Assemble a dispatcher that spawns the configured backends and talks
    /// to the Anthropic API.
    pub fn from_config(config: &Config) -> Result<Self> {
        let agent = AgentLoop::with_options(config.anthropic()?, config.agent_options());
        let connector = StdioConnector::new(config.session_options());
        Ok(Self::new(config.registry()?, connector, agent).with_policy(config.policy()))
    }
}

impl<B: LlmBackend, C: Connector> Dispatcher<B, C> {
    pub fn new(registry: BackendRegistry, connector: C, agent: AgentLoop<B>) -> Self {
        Self {
            registry,
            manager: SessionManager::new(connector),
            agent,
            policy: ConnectionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &SessionManager<C> {
        &self.manager
    }

    /// Answer `text` with the tools of backend `name`.
    pub async fn query(&self, name: &str, text: &str) -> Result<Answer> {
        self.query_with(name, text, self.policy, &CancellationToken::new())
            .await
    }

    /// Like [`query`](Self::query) with an explicit policy and cancellation.
    ///
    /// The session is released however the query ends; under
    /// [`ConnectionPolicy::Ephemeral`] that closes it.
    pub async fn query_with(
        &self,
        name: &str,
        text: &str,
        policy: ConnectionPolicy,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let target = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownBackend(name.to_string()))?;

        tracing::info!(backend = name, ?policy, "query started");
        let lease = self.manager.acquire(target, policy).await?;
        let result = self.agent.run(&*lease, text, cancel).await;
        lease.release().await;

        match &result {
            Ok(answer) => tracing::info!(
                backend = name,
                round_trips = answer.round_trips,
                tool_calls = answer.tool_calls,
                "query finished"
            ),
            Err(e) => tracing::warn!(backend = name, error = %e, "query failed"),
        }
        result
    }

    /// Close every persistent session.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
