use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mcp::{BackendTarget, CallToolResult, ToolContent, ToolDescriptor};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::manager::Connector;
use crate::model::{
    ContentBlock, LlmBackend, ModelError, ModelRequest, ModelResponse, ToolCall, Turn, Usage,
};
use crate::tools::ToolSession;

// ===================
// Mock LLM Provider
// ===================

/// Replays scripted responses, then answers `fallback` forever.
pub struct MockBackend {
    responses: Mutex<Vec<Result<ModelResponse, ModelError>>>,
    fallback: Vec<ContentBlock>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Turn>>>,
}

impl MockBackend {
    pub fn new(responses: Vec<Result<ModelResponse, ModelError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().rev().collect()),
            fallback: vec![ContentBlock::Text("Done".into())],
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Requests the same tool on every call.
    pub fn always_tool(name: &str) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.fallback = vec![tool_use("toolu", name, json!({}))];
        backend
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The transcripts the backend was called with.
    pub fn seen(&self) -> Vec<Vec<Turn>> {
        self.seen.lock().unwrap().clone()
    }
}

impl LlmBackend for MockBackend {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.turns.to_vec());
        let next = self.responses.lock().unwrap().pop();
        next.unwrap_or_else(|| Ok(reply(self.fallback.clone())))
    }
}

pub fn reply(blocks: Vec<ContentBlock>) -> ModelResponse {
    ModelResponse {
        blocks,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 20,
        },
    }
}

pub fn text(text: &str) -> ContentBlock {
    ContentBlock::Text(text.into())
}

pub fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
    ContentBlock::ToolUse(ToolCall {
        id: id.into(),
        name: name.into(),
        input,
    })
}

// ===================
// Mock Tool Session
// ===================

type CallHandler =
    Box<dyn Fn(&str, Option<Map<String, Value>>) -> mcp::Result<CallToolResult> + Send + Sync>;

pub struct MockSession {
    tools: Arc<[ToolDescriptor]>,
    handler: CallHandler,
    ready: AtomicBool,
    calls: AtomicUsize,
    closes: AtomicUsize,
    live: Option<Arc<LiveCounter>>,
}

impl MockSession {
    pub fn new(
        tools: &[&str],
        handler: impl Fn(&str, Option<Map<String, Value>>) -> mcp::Result<CallToolResult>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let tools = tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: Some(format!("{name} tool")),
                input_schema: json!({"type": "object"}),
            })
            .collect::<Vec<_>>();
        Self {
            tools: tools.into(),
            handler: Box::new(handler),
            ready: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            live: None,
        }
    }

    /// A session whose tools all answer `output`.
    pub fn answering(tools: &[&str], output: &'static str) -> Self {
        Self::new(tools, move |_, _| Ok(text_result(output)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulate a broken stream without going through `close`.
    pub fn break_transport(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}

impl ToolSession for MockSession {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> mcp::Result<Arc<[ToolDescriptor]>> {
        if !self.is_ready() {
            return Err(mcp::Error::NotReady(mcp::SessionState::Closed));
        }
        Ok(Arc::clone(&self.tools))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> mcp::Result<CallToolResult> {
        if !self.is_ready() {
            return Err(mcp::Error::NotReady(mcp::SessionState::Closed));
        }
        if !self.tools.iter().any(|tool| tool.name == name) {
            return Err(mcp::Error::ToolNotFound(name.to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.handler)(name, arguments);
        if matches!(result, Err(ref e) if e.is_transport()) {
            self.ready.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn close(&self) {
        let first = self.closes.fetch_add(1, Ordering::SeqCst) == 0;
        self.ready.store(false, Ordering::SeqCst);
        if first {
            if let Some(live) = &self.live {
                live.leave();
            }
        }
    }
}

pub fn text_result(text: &str) -> CallToolResult {
    CallToolResult {
        content: vec![ToolContent::Text(text.to_string())],
        is_error: false,
    }
}

// ===================
// Mock Connector
// ===================

/// Tracks how many sessions are open at once.
#[derive(Default)]
pub struct LiveCounter {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl LiveCounter {
    fn enter(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Opens `MockSession`s, optionally failing, and counts them.
#[derive(Default)]
pub struct MockConnector {
    pub opened: AtomicUsize,
    pub live: Arc<LiveCounter>,
    pub fail: AtomicBool,
    /// When set, every tool call on new sessions cancels this token.
    pub cancel_on_call: Mutex<Option<CancellationToken>>,
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, target: &BackendTarget) -> mcp::Result<MockSession> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(mcp::Error::Handshake(format!("{target} refused")));
        }
        // Widen the race window for concurrent acquires.
        tokio::task::yield_now().await;
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.enter();
        let cancel_on_call = self.cancel_on_call.lock().unwrap().clone();
        let mut session = match cancel_on_call {
            Some(token) => MockSession::new(&["get_forecast"], move |_, _| {
                token.cancel();
                Ok(text_result("Sunny"))
            }),
            None => MockSession::answering(&["get_forecast"], "Sunny"),
        };
        session.live = Some(Arc::clone(&self.live));
        Ok(session)
    }
}
