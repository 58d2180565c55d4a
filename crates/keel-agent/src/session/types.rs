use crate::abort::AbortSignal;
use crate::accounting::AccountingEntry;
use crate::transport::{FinalReport, ReportSource};
use keel_llm::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    Canceled,
    Stopping,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Canceled => "canceled",
            SessionStatus::Stopping => "stopping",
        }
    }
}

/// Terminal outcome of one session. `run` always returns one of these; the
/// `success` flag and `error` string are the sole failure signal to callers.
#[derive(Clone, Debug)]
pub struct SessionResult {
    pub success: bool,
    pub status: SessionStatus,
    pub final_report: Option<FinalReport>,
    pub report_source: Option<ReportSource>,
    pub conversation: Vec<Message>,
    pub accounting: Vec<AccountingEntry>,
    pub error: Option<String>,
    pub turns_used: usize,
}

/// Identifiers threaded through nested sessions so spawned children form a
/// traceable tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Session id of the tree root.
    pub origin_id: String,
    /// Session id of the direct parent, if any.
    pub parent_id: Option<String>,
    /// Human-readable chain from root to this session.
    pub call_path: String,
}

impl TraceContext {
    pub fn root(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            origin_id: session_id.clone(),
            parent_id: None,
            call_path: session_id,
        }
    }

    pub fn child(&self, parent_session_id: &str, child_id: &str) -> Self {
        Self {
            origin_id: self.origin_id.clone(),
            parent_id: Some(parent_session_id.to_string()),
            call_path: format!("{} > {}", self.call_path, child_id),
        }
    }
}

/// Control handle for a running session. `stop` is graceful: the current
/// turn finishes, then the session halts. `cancel` aborts immediately,
/// including in-flight queue waiters and provider calls.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    stop_requested: Arc<AtomicBool>,
    abort: AbortSignal,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: String,
        stop_requested: Arc<AtomicBool>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            session_id,
            stop_requested,
            abort,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_child_extends_call_path_and_sets_parent() {
        let root = TraceContext::root("s-root");
        let child = root.child("s-root", "s-child");
        assert_eq!(child.origin_id, "s-root");
        assert_eq!(child.parent_id.as_deref(), Some("s-root"));
        assert_eq!(child.call_path, "s-root > s-child");

        let grandchild = child.child("s-child", "s-grand");
        assert_eq!(grandchild.origin_id, "s-root");
        assert_eq!(grandchild.call_path, "s-root > s-child > s-grand");
    }
}
