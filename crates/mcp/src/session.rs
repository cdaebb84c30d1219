//! Backend sessions: one subprocess, one stream, one lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::model::CallToolRequestParams;
use rmcp::service::{Peer, RoleClient, RunningService, ServiceError};
use serde_json::{Map, Value};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::limit::{LineLimit, MAX_LINE_LENGTH};
use crate::protocol::{
    CallToolResult, InitializeResult, SUPPORTED_PROTOCOL_VERSIONS, ToolDescriptor, decode,
};
use crate::stderr::StderrTail;
use crate::target::BackendTarget;

/// Default bound on the `initialize` round-trip.
///
/// Generous because some servers import heavy frameworks at startup.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on every other RPC.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between closing stdin and killing the child.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failed handshake waits for stderr to drain.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Timeouts applied to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Lifecycle of a session. Moves forward only; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Handshaking = 1,
    Ready = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Handshaking,
            2 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A live connection to one backend process.
///
/// The session exclusively owns the child and its stdio. All methods take
/// `&self`, so one session can be shared (behind an `Arc`) by concurrent
/// queries. The MCP client service writes whole frames from its own task
/// and routes each response to its request by id.
pub struct Session {
    target: BackendTarget,
    options: SessionOptions,
    state: AtomicU8,
    child: Mutex<Option<Child>>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    peer: OnceLock<Peer<RoleClient>>,
    catalog: Mutex<Option<Arc<[ToolDescriptor]>>>,
    server_info: OnceLock<InitializeResult>,
    stderr: StderrTail,
}

impl Session {
    /// Spawn the backend and complete the handshake.
    ///
    /// On handshake failure the child is torn down before the error is
    /// returned.
    pub async fn open(target: BackendTarget, options: SessionOptions) -> Result<Self> {
        let mut child = target.command().spawn().map_err(|source| Error::Spawn {
            program: target.program().display().to_string(),
            source,
        })?;

        let pipe_missing = |pipe: &str| Error::Spawn {
            program: target.program().display().to_string(),
            source: std::io::Error::other(format!("failed to capture {pipe}")),
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_missing("stdout"))?;
        let stderr = StderrTail::spawn(child.stderr.take(), target.to_string());

        tracing::info!(backend = %target, pid = ?child.id(), "spawned backend");

        let session = Self {
            target,
            options,
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            child: Mutex::new(Some(child)),
            service: Mutex::new(None),
            peer: OnceLock::new(),
            catalog: Mutex::new(None),
            server_info: OnceLock::new(),
            stderr,
        };

        if let Err(e) = session.handshake(stdout, stdin).await {
            session.close().await;
            let stderr = session.stderr.excerpt(STDERR_SETTLE).await;
            let reason = match e {
                Error::Handshake(reason) => reason,
                other => other.to_string(),
            };
            return Err(if stderr.is_empty() {
                Error::Handshake(reason)
            } else {
                Error::Handshake(format!("{reason} | stderr: {}", stderr.trim()))
            });
        }

        Ok(session)
    }

    async fn handshake(&self, stdout: ChildStdout, stdin: ChildStdin) -> Result<()> {
        self.set_state(SessionState::Handshaking);

        let transport = (LineLimit::new(stdout, MAX_LINE_LENGTH), stdin);
        let service = match timeout(self.options.handshake_timeout, ().serve(transport)).await {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => return Err(Error::Handshake(e.to_string())),
            Err(_) => {
                return Err(Error::Handshake(format!(
                    "no initialize acknowledgement within {:?}",
                    self.options.handshake_timeout
                )));
            }
        };

        let result: InitializeResult = match service.peer_info() {
            Some(info) => decode("initialize", info)
                .map_err(|e| Error::Handshake(format!("malformed initialize result: {e}")))?,
            None => return Err(Error::Handshake("no initialize result".into())),
        };
        let peer = service.peer().clone();
        // close() cancels the service of a rejected peer too.
        *self.service.lock().await = Some(service);

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::Handshake(format!(
                "unsupported protocol version {}",
                result.protocol_version
            )));
        }

        tracing::info!(
            backend = %self.target,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "backend ready"
        );
        let _ = self.peer.set(peer);
        let _ = self.server_info.set(result);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// The target this session was opened for.
    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// What the backend reported about itself during the handshake.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// Check if the backend process is still running.
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The backend's tool catalog, fetched on first use and cached while
    /// the session stays ready.
    pub async fn list_tools(&self) -> Result<Arc<[ToolDescriptor]>> {
        let mut cache = self.catalog.lock().await;
        self.ensure_ready()?;
        if let Some(catalog) = cache.as_ref() {
            return Ok(Arc::clone(catalog));
        }

        let catalog = self.fetch_tools().await?;
        *cache = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Drop the cached catalog and fetch it again.
    pub async fn refresh_tools(&self) -> Result<Arc<[ToolDescriptor]>> {
        let mut cache = self.catalog.lock().await;
        *cache = None;
        let catalog = self.fetch_tools().await?;
        *cache = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    async fn fetch_tools(&self) -> Result<Arc<[ToolDescriptor]>> {
        let peer = self.peer()?;
        // Follows `nextCursor` until the last page.
        let tools = self.request("tools/list", peer.list_all_tools()).await?;
        let tools: Vec<ToolDescriptor> = decode("tools/list", &tools)?;

        tracing::debug!(
            backend = %self.target,
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "fetched tool catalog"
        );
        Ok(tools.into())
    }

    /// Call a tool by name.
    ///
    /// Arguments are passed through unvalidated; the backend owns schema
    /// checks.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let catalog = self.list_tools().await?;
        if !catalog.iter().any(|tool| tool.name == name) {
            return Err(Error::ToolNotFound(name.to_string()));
        }

        let peer = self.peer()?;
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments,
            meta: None,
            task: None,
        };
        let raw = match self.request("tools/call", peer.call_tool(params)).await {
            Ok(raw) => raw,
            Err(Error::Rpc(reason)) => return Err(Error::ToolExecution(reason)),
            Err(e) => return Err(e),
        };

        let result: CallToolResult = decode("tools/call", &raw)?;
        if result.is_error {
            return Err(Error::ToolExecution(result.text()));
        }
        Ok(result)
    }

    /// Stop the client service, give the child a grace period to exit,
    /// then kill and reap it.
    ///
    /// Idempotent. Never fails: teardown problems are logged and dropped so
    /// this is safe on any error path.
    pub async fn close(&self) {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::SeqCst);
        if SessionState::from_u8(previous) == SessionState::Closed {
            return;
        }

        // Cancelling the service drops the transport, closing the child's stdin.
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            match timeout(self.options.shutdown_timeout, service.cancel()).await {
                Ok(Ok(reason)) => {
                    tracing::debug!(backend = %self.target, ?reason, "client service stopped");
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.target, error = %e, "client service panicked");
                }
                Err(_) => {
                    tracing::warn!(backend = %self.target, "client service did not stop in time");
                }
            }
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match timeout(self.options.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.target, %status, "backend exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(backend = %self.target, error = %e, "failed to reap backend");
            }
            Err(_) => {
                tracing::warn!(
                    backend = %self.target,
                    grace = ?self.options.shutdown_timeout,
                    "backend did not exit, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(backend = %self.target, error = %e, "failed to kill backend");
                }
            }
        }
    }

    // --- Internal methods ---

    fn set_state(&self, state: SessionState) {
        // Never leave Closed.
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (SessionState::from_u8(current) != SessionState::Closed).then_some(state as u8)
            });
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(Error::NotReady(other)),
        }
    }

    fn peer(&self) -> Result<Peer<RoleClient>> {
        self.ensure_ready()?;
        self.peer
            .get()
            .cloned()
            .ok_or(Error::NotReady(self.state()))
    }

    /// Await one RPC under the request timeout and translate its failure.
    ///
    /// A broken stream closes the session before the error is returned. A
    /// timeout leaves it ready; the late response is discarded by the
    /// client service.
    async fn request<T>(
        &self,
        method: &str,
        call: impl Future<Output = std::result::Result<T, ServiceError>>,
    ) -> Result<T> {
        let timed_out = || Error::Timeout {
            method: method.to_string(),
            after: self.options.request_timeout,
        };
        match timeout(self.options.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ServiceError::McpError(e))) => {
                Err(Error::Rpc(format!("[{}] {}", e.code.0, e.message)))
            }
            Ok(Err(ServiceError::Timeout { .. })) | Err(_) => Err(timed_out()),
            Ok(Err(
                e @ (ServiceError::TransportClosed
                | ServiceError::TransportSend(_)
                | ServiceError::Cancelled { .. }),
            )) => {
                tracing::warn!(backend = %self.target, method, error = %e, "transport broke");
                self.close().await;
                Err(Error::Transport(e.to_string()))
            }
            Ok(Err(e)) => Err(Error::InvalidResponse(format!("{method}: {e}"))),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    const INIT_OK: &str = r#"{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"1"}}}"#;
    const TOOLS: &str = r#"{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"get_forecast","description":"Forecast for a city","inputSchema":{"type":"object"}}]}}"#;
    const CALL_OK: &str = r#"{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"Sunny"}],"isError":false}}"#;

    /// Shell action printing `template` with the request id as its `%s`.
    fn reply(template: &str) -> String {
        format!(
            "printf '{}\\n' \"$id\"",
            template.replace('\'', r"'\''")
        )
    }

    /// A line-oriented fake backend in plain sh. `cases` maps a method
    /// name to a shell action; `$id` holds the request id.
    fn fake_backend(cases: &[(&str, String)]) -> BackendTarget {
        let mut script = String::from(
            "while IFS= read -r line; do\n\
             id=$(printf '%s' \"$line\" | sed -n 's/^{\"jsonrpc\":\"2.0\",\"id\":\\([0-9]*\\).*/\\1/p')\n\
             case \"$line\" in\n",
        );
        for (method, action) in cases {
            script.push_str(&format!("*'\"method\":\"{method}\"'*) {action} ;;\n"));
        }
        script.push_str("esac\ndone\n");
        BackendTarget::new("/bin/sh").arg("-c").arg(script)
    }

    fn fast() -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn open_list_call_close() {
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
            ("tools/call", reply(CALL_OK)),
        ]);

        let session = Session::open(target, fast()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.server_info().unwrap().server_info.name, "fake");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].description(), "Forecast for a city");

        let args = json!({"city": "Paris"}).as_object().cloned();
        let result = session.call_tool("get_forecast", args).await.unwrap();
        assert_eq!(result.text(), "Sunny");

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_running().await);
        session.close().await;
        assert!(matches!(
            session.list_tools().await,
            Err(Error::NotReady(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn server_request_is_not_taken_for_the_response() {
        // Before answering the call, the backend pings the client with the
        // same numeric id.
        let ping = r#"{"jsonrpc":"2.0","id":%s,"method":"ping"}"#;
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
            ("tools/call", format!("{}; {}", reply(ping), reply(CALL_OK))),
        ]);
        let session = Session::open(target, fast()).await.unwrap();

        let result = session.call_tool("get_forecast", None).await.unwrap();
        assert_eq!(result.text(), "Sunny");
        assert!(session.is_ready());
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_tool_is_not_sent() {
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
        ]);
        let session = Session::open(target, fast()).await.unwrap();

        let err = session.call_tool("launch_rocket", None).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(name) if name == "launch_rocket"));
        assert!(session.is_ready());
        session.close().await;
    }

    #[tokio::test]
    async fn backend_reported_failure_is_tool_execution() {
        let call_err = r#"{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"city not found"}],"isError":true}}"#;
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
            ("tools/call", reply(call_err)),
        ]);
        let session = Session::open(target, fast()).await.unwrap();

        let err = session.call_tool("get_forecast", None).await.unwrap_err();
        assert!(matches!(err, Error::ToolExecution(text) if text == "city not found"));
        assert!(session.is_ready());
        session.close().await;
    }

    #[tokio::test]
    async fn error_response_is_tool_execution() {
        let rpc_err = r#"{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"missing city"}}"#;
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
            ("tools/call", reply(rpc_err)),
        ]);
        let session = Session::open(target, fast()).await.unwrap();

        let err = session.call_tool("get_forecast", None).await.unwrap_err();
        assert!(matches!(err, Error::ToolExecution(text) if text.contains("missing city")));
        assert!(session.is_ready());
        session.close().await;
    }

    #[tokio::test]
    async fn transport_break_closes_session() {
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", reply(TOOLS)),
            ("tools/call", "exit 0".to_string()),
        ]);
        let session = Session::open(target, fast()).await.unwrap();
        session.list_tools().await.unwrap();

        let err = session.call_tool("get_forecast", None).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_running().await);
    }

    #[tokio::test]
    async fn overlong_line_closes_session() {
        // Two megabytes with no newline.
        let flood = "head -c 2000000 /dev/zero | tr '\\000' x".to_string();
        let target = fake_backend(&[("initialize", reply(INIT_OK)), ("tools/list", flood)]);
        let session = Session::open(target, fast()).await.unwrap();

        let err = session.list_tools().await.unwrap_err();
        assert!(err.is_transport(), "{err}");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_running().await);
    }

    #[tokio::test]
    async fn timeout_mid_write_keeps_framing_intact() {
        // Stops reading for a second after the catalog, so a large call
        // blocks in the pipe past the request timeout.
        let target = fake_backend(&[
            ("initialize", reply(INIT_OK)),
            ("tools/list", format!("{}; sleep 1", reply(TOOLS))),
            ("tools/call", reply(CALL_OK)),
        ]);
        let options = SessionOptions {
            request_timeout: Duration::from_millis(500),
            ..fast()
        };
        let session = Session::open(target, options).await.unwrap();
        session.list_tools().await.unwrap();

        let big = json!({"notes": "x".repeat(256 * 1024)}).as_object().cloned();
        let err = session.call_tool("get_forecast", big).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { ref method, .. } if method == "tools/call"));
        assert!(session.is_ready());

        // Let the backend drain the large frame and answer it.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let result = session.call_tool("get_forecast", None).await.unwrap();
        assert_eq!(result.text(), "Sunny");
        session.close().await;
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let target = BackendTarget::new("/nonexistent/backend-server");
        let err = Session::open(target, fast()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn protocol_mismatch_is_handshake_error() {
        let old = r#"{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"1999-01-01","capabilities":{},"serverInfo":{"name":"old","version":"0.1"}}}"#;
        let target = fake_backend(&[("initialize", reply(old))]);
        let err = Session::open(target, fast()).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out_handshake() {
        let target = BackendTarget::new("/bin/sh").arg("-c").arg("sleep 30");
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(200),
            ..fast()
        };
        let started = std::time::Instant::now();
        let err = Session::open(target, options).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(reason) if reason.contains("acknowledgement")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn early_exit_reports_stderr() {
        let target = BackendTarget::new("/bin/sh")
            .arg("-c")
            .arg("echo 'missing GITHUB_PAT' >&2; exit 1");
        let err = Session::open(target, fast()).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(reason) if reason.contains("missing GITHUB_PAT")));
    }

    #[tokio::test]
    async fn overlay_is_merged_over_inherited_environment() {
        // The fake reports $TOKEN and $PATH back through serverInfo.
        let init = r#"{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"%s","version":"%s"}}}"#;
        let report = format!("printf '{init}\\n' \"$id\" \"$TOKEN\" \"$PATH\"");
        let target = fake_backend(&[("initialize", report)]).env("TOKEN", "abc");

        let session = Session::open(target, fast()).await.unwrap();
        let info = &session.server_info().unwrap().server_info;
        assert_eq!(info.name, "abc");
        assert_eq!(info.version.as_deref(), std::env::var("PATH").ok().as_deref());
        session.close().await;
    }
}
