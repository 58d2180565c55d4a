use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EventData = HashMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    TurnStart,
    AssistantChunk,
    AssistantOutput,
    ToolCallStart,
    ToolCallEnd,
    ReportCommitted,
    Accounting,
    Retry,
    Warning,
    Error,
}

/// Tagged union carried on the session's single outbound event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub data: EventData,
}

impl SessionEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, data: EventData) -> Self {
        Self {
            kind,
            timestamp_ms: now_ms(),
            session_id: session_id.into(),
            data,
        }
    }

    pub fn with_fields(
        kind: EventKind,
        session_id: impl Into<String>,
        fields: &[(&str, Value)],
    ) -> Self {
        let data = fields
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect();
        Self::new(kind, session_id, data)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Event sink attached to a session. Delivery is best-effort: the runner
/// never blocks on a consumer, and a misbehaving consumer cannot fail a run.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: SessionEvent) {}
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<SessionEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.inner
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.snapshot().into_iter().map(|event| event.kind).collect()
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: SessionEvent) {
        if let Ok(mut events) = self.inner.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buffered_emitter_stores_events_in_order() {
        let emitter = BufferedEventEmitter::default();
        emitter.emit(SessionEvent::new(
            EventKind::SessionStart,
            "s1",
            EventData::new(),
        ));
        emitter.emit(SessionEvent::with_fields(
            EventKind::TurnStart,
            "s1",
            &[("turn", json!(1))],
        ));

        let kinds = emitter.kinds();
        assert_eq!(kinds, vec![EventKind::SessionStart, EventKind::TurnStart]);
    }
}
