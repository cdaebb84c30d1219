//! Drains a backend's stderr so it never blocks on a full pipe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;

/// Lines kept for error reports.
const TAIL_LINES: usize = 20;

/// Background reader that logs stderr and keeps its last few lines.
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StderrTail {
    pub(crate) fn spawn(stderr: Option<ChildStderr>, backend: String) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let task = stderr.map(|stderr| {
            let lines = Arc::clone(&lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!(backend = %backend, "stderr: {line}");
                    let mut tail = lines.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });
        Self {
            lines,
            task: Mutex::new(task),
        }
    }

    /// Wait up to `wait` for the child to finish writing, then return what
    /// was captured, newline-joined.
    pub(crate) async fn excerpt(&self, wait: Duration) -> String {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(wait, task).await;
        }
        let tail = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

impl Drop for StderrTail {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
