//! Session lifetimes across queries.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use mcp::{BackendTarget, Session, SessionOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::tools::ToolSession;

/// Whether a backend session outlives the query that opened it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    /// Open a fresh session per query and close it when the query ends.
    Ephemeral,
    /// Keep one session per target and reuse it while it stays ready.
    #[default]
    Persistent,
}

/// Opens sessions for the manager.
pub trait Connector: Send + Sync {
    type Session: ToolSession + 'static;

    fn connect(
        &self,
        target: &BackendTarget,
    ) -> impl Future<Output = mcp::Result<Self::Session>> + Send;
}

/// Spawns backends as child processes speaking MCP on stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConnector {
    options: SessionOptions,
}

impl StdioConnector {
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

impl Connector for StdioConnector {
    type Session = Session;

    async fn connect(&self, target: &BackendTarget) -> mcp::Result<Session> {
        Session::open(target.clone(), self.options).await
    }
}

/// A session handed out for one query.
pub struct Lease<S> {
    session: Arc<S>,
    policy: ConnectionPolicy,
}

impl<S: ToolSession> Lease<S> {
    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    /// End the query's use of the session. Ephemeral sessions are closed;
    /// persistent ones stay with the manager.
    pub async fn release(self) {
        if self.policy == ConnectionPolicy::Ephemeral {
            self.session.close().await;
        }
    }
}

impl<S> Deref for Lease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

type Slot<S> = Arc<Mutex<Option<Arc<S>>>>;

/// Owns persistent sessions, at most one per target.
///
/// Each target has its own slot lock, so concurrent first use of a target
/// opens exactly one session while other targets proceed independently.
/// A replaced session is closed before its successor is opened.
pub struct SessionManager<C: Connector> {
    connector: C,
    slots: Mutex<HashMap<BackendTarget, Slot<C::Session>>>,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// A ready session for `target` under `policy`.
    pub async fn acquire(
        &self,
        target: &BackendTarget,
        policy: ConnectionPolicy,
    ) -> mcp::Result<Lease<C::Session>> {
        if policy == ConnectionPolicy::Ephemeral {
            tracing::debug!(backend = %target, "opening ephemeral session");
            let session = self.connector.connect(target).await?;
            return Ok(Lease {
                session: Arc::new(session),
                policy,
            });
        }

        let slot = self.slot(target).await;
        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref().filter(|session| session.is_ready()) {
            return Ok(Lease {
                session: Arc::clone(session),
                policy,
            });
        }

        if let Some(stale) = current.take() {
            tracing::info!(backend = %target, "replacing session that is no longer ready");
            stale.close().await;
        }

        tracing::debug!(backend = %target, "opening persistent session");
        let session = match self.connector.connect(target).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                drop(current);
                drop(slot);
                self.forget_if_idle(target).await;
                return Err(e);
            }
        };
        *current = Some(Arc::clone(&session));
        Ok(Lease { session, policy })
    }

    /// Make `session` the persistent session for `target`, closing any
    /// session it replaces.
    pub async fn install(&self, target: &BackendTarget, session: C::Session) {
        let slot = self.slot(target).await;
        let mut current = slot.lock().await;
        if let Some(previous) = current.replace(Arc::new(session)) {
            previous.close().await;
        }
    }

    /// Whether a ready persistent session exists for `target`.
    pub async fn has_ready(&self, target: &BackendTarget) -> bool {
        let slot = self.slots.lock().await.get(target).cloned();
        match slot {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|session| session.is_ready()),
            None => false,
        }
    }

    /// Close the persistent session for `target`, if any.
    pub async fn release(&self, target: &BackendTarget) {
        let slot = self.slots.lock().await.get(target).cloned();
        let Some(slot) = slot else {
            return;
        };
        let session = slot.lock().await.take();
        drop(slot);
        if let Some(session) = session {
            tracing::debug!(backend = %target, "closing persistent session");
            session.close().await;
        }
        self.forget_if_idle(target).await;
    }

    /// Close every persistent session.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(target, slot)| (target.clone(), Arc::clone(slot)))
            .collect();

        for (target, slot) in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                tracing::debug!(backend = %target, "closing persistent session");
                session.close().await;
            }
        }

        self.slots.lock().await.retain(|_, slot| !is_idle(slot));
    }

    async fn slot(&self, target: &BackendTarget) -> Slot<C::Session> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(target.clone()).or_default())
    }

    /// Drop the entry for `target` once it holds no session. Targets carry
    /// secrets, so empty entries are not kept around.
    async fn forget_if_idle(&self, target: &BackendTarget) {
        let mut slots = self.slots.lock().await;
        if slots.get(target).is_some_and(is_idle) {
            slots.remove(target);
        }
    }
}

/// Empty, and referenced only by the map. New references are handed out
/// under the map lock, so this holds while the caller keeps that lock.
fn is_idle<S>(slot: &Slot<S>) -> bool {
    Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|current| current.is_none())
}
