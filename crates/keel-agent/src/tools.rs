use crate::queue::DEFAULT_QUEUE;
use async_trait::async_trait;
use keel_llm::{ToolCall, ToolSchema};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reserved tool the model calls to submit its final report.
pub const FINAL_REPORT_TOOL: &str = "agent__final_report";

/// Result of executing one tool call. Failures are data, not errors: the
/// text is fed back to the model either way.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub ok: bool,
    pub text: String,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(text: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            ok: true,
            text: text.into(),
            latency_ms,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, latency_ms: u64) -> Self {
        let error = error.into();
        Self {
            ok: false,
            text: format!("tool error: {error}"),
            latency_ms,
            error: Some(error),
        }
    }
}

/// Implemented by anything a session can invoke as a tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> ToolOutcome;
}

/// One registered tool: its advertised schema, the concurrency queue it
/// executes on, and the executor itself.
#[derive(Clone)]
pub struct RegisteredTool {
    pub schema: ToolSchema,
    pub queue: String,
    pub executor: Arc<dyn ToolExecutor>,
}

/// Registration-ordered tool table for one session. Insertion order is
/// preserved in the schemas advertised to the model.
#[derive(Clone, Default)]
pub struct ToolCatalogue {
    names: Vec<String>,
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool on an explicit queue. Re-registering a name replaces
    /// the previous entry but keeps its position.
    pub fn register(
        &mut self,
        schema: ToolSchema,
        queue: impl Into<String>,
        executor: Arc<dyn ToolExecutor>,
    ) {
        let name = schema.name.clone();
        if !self.tools.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.tools.insert(
            name,
            RegisteredTool {
                schema,
                queue: queue.into(),
                executor,
            },
        );
    }

    /// Register a tool on the default queue.
    pub fn register_default(&mut self, schema: ToolSchema, executor: Arc<dyn ToolExecutor>) {
        self.register(schema, DEFAULT_QUEUE, executor);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas in registration order, for the provider request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema.clone())
            .collect()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .tools
            .values()
            .map(|tool| tool.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }
}

/// Schema for the reserved final-report tool. Always advertised alongside
/// the registered tools so the model has a structured exit path.
pub fn final_report_schema(output_format: &str) -> ToolSchema {
    ToolSchema {
        name: FINAL_REPORT_TOOL.to_string(),
        description: format!(
            "Submit the final report for this session. Call exactly once, as \
             your last action, with the complete report in {output_format} \
             format."
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "report_format": {
                    "type": "string",
                    "description": "Format of report_content; must match the requested output format."
                },
                "report_content": {
                    "type": "string",
                    "description": "The complete report body."
                }
            },
            "required": ["report_format", "report_content"]
        }),
    }
}
