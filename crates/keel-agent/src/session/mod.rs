//! The session runner: one multi-turn conversation loop per session.

mod failures;
mod runner;
mod types;

pub use failures::*;
pub use types::*;

use crate::abort::AbortSignal;
use crate::accounting::AccountingLog;
use crate::config::SessionConfig;
use crate::events::{EventEmitter, NoopEventEmitter};
use crate::queue::ToolQueueManager;
use crate::tools::ToolCatalogue;
use crate::transport::{FinalReportManager, MetaPlugin};
use keel_llm::{ChunkSink, HeuristicTokenizer, Message, ModelTarget, ProviderRegistry, Tokenizer};
use keel_store::CacheStore;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use uuid::Uuid;

/// One agent session. Owns its conversation, report slot, and accounting
/// log; shares the provider registry, queue manager, and cache store with
/// whatever composed it. Built with the `with_*` methods, consumed by `run`.
pub struct Session {
    id: String,
    config: SessionConfig,
    targets: Vec<ModelTarget>,
    providers: Arc<ProviderRegistry>,
    tools: ToolCatalogue,
    meta_plugins: Vec<MetaPlugin>,
    queues: Arc<ToolQueueManager>,
    tokenizer: Arc<dyn Tokenizer + Send + Sync>,
    emitter: Arc<dyn EventEmitter>,
    tool_cache: Option<Arc<dyn CacheStore>>,
    chunk_sink: Option<ChunkSink>,
    initial_messages: Vec<Message>,
    report: FinalReportManager,
    accounting: AccountingLog,
    abort: AbortSignal,
    stop_requested: Arc<AtomicBool>,
    trace: TraceContext,
}

impl Session {
    pub fn new(
        targets: Vec<ModelTarget>,
        providers: Arc<ProviderRegistry>,
        queues: Arc<ToolQueueManager>,
    ) -> Self {
        let id = format!("session-{}", Uuid::new_v4());
        let trace = TraceContext::root(id.clone());
        Self {
            id,
            config: SessionConfig::default(),
            targets,
            providers,
            tools: ToolCatalogue::new(),
            meta_plugins: Vec::new(),
            queues,
            tokenizer: Arc::new(HeuristicTokenizer),
            emitter: Arc::new(NoopEventEmitter),
            tool_cache: None,
            chunk_sink: None,
            initial_messages: Vec::new(),
            report: FinalReportManager::new(),
            accounting: AccountingLog::new(),
            abort: AbortSignal::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            trace,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: ToolCatalogue) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_meta_plugins(mut self, plugins: Vec<MetaPlugin>) -> Self {
        self.meta_plugins = plugins;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer + Send + Sync>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_tool_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.tool_cache = Some(cache);
        self
    }

    pub fn with_chunk_sink(mut self, sink: ChunkSink) -> Self {
        self.chunk_sink = Some(sink);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Seed the conversation. System prompt first, then user prompt, in the
    /// order the `with_*` calls are made.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_messages.push(Message::system(prompt));
        self
    }

    pub fn with_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_messages.push(Message::user(prompt));
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.initial_messages = messages;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Control handle usable from outside the running session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.id.clone(),
            self.stop_requested.clone(),
            self.abort.clone(),
        )
    }
}
