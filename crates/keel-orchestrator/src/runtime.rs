use crate::errors::OrchestratorError;
use crate::graph::{EdgeKind, OrchestrationGraph};
use async_trait::async_trait;
use futures::future::join_all;
use keel_agent::{
    EventEmitter, MetaPlugin, NoopEventEmitter, Session, SessionConfig, SessionResult,
    ToolCatalogue, ToolExecutor, ToolOutcome, ToolQueueManager, TraceContext,
};
use keel_llm::{ModelTarget, ProviderRegistry, ToolCall, ToolSchema};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Tool an agent calls to transfer control permanently.
pub const HANDOFF_TOOL: &str = "agent__handoff";
/// Tool an agent calls to name a router destination at runtime.
pub const ROUTE_TOOL: &str = "agent__route";
/// Tool an agent calls to run a child agent and get its report back.
pub const SPAWN_TOOL: &str = "agent__spawn";

/// Queue control-plane tools execute on.
const CONTROL_QUEUE: &str = "control";

/// Everything needed to run one agent as a session.
#[derive(Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: String,
    pub targets: Vec<ModelTarget>,
    pub config: SessionConfig,
    pub tools: ToolCatalogue,
    pub meta_plugins: Vec<MetaPlugin>,
}

impl AgentDefinition {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        targets: Vec<ModelTarget>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            targets,
            config: SessionConfig::default(),
            tools: ToolCatalogue::new(),
            meta_plugins: Vec::new(),
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
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RoutingRequest {
    target: String,
    task: String,
}

type RoutingSlot = Arc<Mutex<Option<RoutingRequest>>>;

struct SessionRouting {
    slot: RoutingSlot,
    handoff: Vec<String>,
    router: Vec<String>,
}

/// Records the requested destination; the transfer itself happens after the
/// session finishes, so the agent still submits its own final report.
struct RoutingTool {
    allowed: Vec<String>,
    slot: RoutingSlot,
}

#[async_trait]
impl ToolExecutor for RoutingTool {
    async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(target) = call.arguments.get("target").and_then(Value::as_str) else {
            return ToolOutcome::failure("target is missing or not a string", 0);
        };
        if !self.allowed.iter().any(|allowed| allowed == target) {
            return ToolOutcome::failure(
                format!(
                    "'{target}' is not a declared destination; choose one of: {}",
                    self.allowed.join(", ")
                ),
                0,
            );
        }
        let task = call
            .arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(RoutingRequest {
            target: target.to_string(),
            task,
        });
        ToolOutcome::success(
            format!(
                "Control will transfer to '{target}'. Submit your final report to conclude your part."
            ),
            0,
        )
    }
}

/// Builds and runs sessions for agents, shared by the orchestrator loop,
/// advisor fan-out, and the spawn tool.
struct ChildSpawner {
    agents: Arc<BTreeMap<String, AgentDefinition>>,
    providers: Arc<ProviderRegistry>,
    queues: Arc<ToolQueueManager>,
    emitter: Arc<dyn EventEmitter>,
    max_spawn_depth: usize,
}

impl ChildSpawner {
    fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    fn build_session(
        self: &Arc<Self>,
        def: &AgentDefinition,
        task: &str,
        advisor_notes: &[String],
        lineage: Option<(TraceContext, String)>,
        depth: usize,
        routing: Option<SessionRouting>,
    ) -> Session {
        let session = Session::new(
            def.targets.clone(),
            self.providers.clone(),
            self.queues.clone(),
        )
        .with_config(def.config.clone())
        .with_meta_plugins(def.meta_plugins.clone())
        .with_emitter(self.emitter.clone());

        let session_id = session.id().to_string();
        let trace = match &lineage {
            Some((parent_trace, parent_id)) => parent_trace.child(parent_id, &session_id),
            None => TraceContext::root(session_id.clone()),
        };

        let mut tools = def.tools.clone();
        if depth < self.max_spawn_depth && self.agents.len() > 1 {
            tools.register(
                spawn_schema(&self.agent_names()),
                CONTROL_QUEUE,
                Arc::new(SpawnTool {
                    spawner: self.clone(),
                    trace: trace.clone(),
                    parent_id: session_id,
                    depth,
                }),
            );
        }
        if let Some(routing) = routing {
            if !routing.handoff.is_empty() {
                tools.register(
                    routing_schema(
                        HANDOFF_TOOL,
                        "Hand control to another agent. You will not resume.",
                        &routing.handoff,
                    ),
                    CONTROL_QUEUE,
                    Arc::new(RoutingTool {
                        allowed: routing.handoff.clone(),
                        slot: routing.slot.clone(),
                    }),
                );
            }
            if !routing.router.is_empty() {
                tools.register(
                    routing_schema(
                        ROUTE_TOOL,
                        "Route the task to one of your declared destinations.",
                        &routing.router,
                    ),
                    CONTROL_QUEUE,
                    Arc::new(RoutingTool {
                        allowed: routing.router,
                        slot: routing.slot,
                    }),
                );
            }
        }

        let mut session = session.with_tools(tools).with_trace(trace);
        if !def.system_prompt.is_empty() {
            session = session.with_system_prompt(def.system_prompt.clone());
        }
        session = session.with_user_prompt(task);
        for note in advisor_notes {
            session = session.with_user_prompt(note.clone());
        }
        session
    }

    async fn run_child(
        self: &Arc<Self>,
        agent: &str,
        task: &str,
        lineage: Option<(TraceContext, String)>,
        depth: usize,
    ) -> Result<SessionResult, OrchestratorError> {
        if depth > self.max_spawn_depth {
            return Err(OrchestratorError::TransferDepthExceeded(
                self.max_spawn_depth,
            ));
        }
        let def = self
            .agents
            .get(agent)
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent.to_string()))?;
        let session = self.build_session(def, task, &[], lineage, depth, None);
        tracing::debug!(agent, depth, session_id = %session.id(), "spawning child session");
        Ok(session.run().await)
    }
}

struct SpawnTool {
    spawner: Arc<ChildSpawner>,
    trace: TraceContext,
    parent_id: String,
    depth: usize,
}

#[async_trait]
impl ToolExecutor for SpawnTool {
    async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(agent) = call.arguments.get("agent").and_then(Value::as_str) else {
            return ToolOutcome::failure("agent is missing or not a string", 0);
        };
        let task = call
            .arguments
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let lineage = Some((self.trace.clone(), self.parent_id.clone()));
        match self
            .spawner
            .run_child(agent, task, lineage, self.depth + 1)
            .await
        {
            Ok(result) if result.success => ToolOutcome::success(
                result
                    .final_report
                    .map(|report| report.content)
                    .unwrap_or_default(),
                0,
            ),
            Ok(result) => ToolOutcome::failure(
                format!(
                    "child agent '{agent}' failed: {}",
                    result
                        .error
                        .unwrap_or_else(|| "unknown failure".to_string())
                ),
                0,
            ),
            Err(error) => ToolOutcome::failure(format!("could not spawn '{agent}': {error}"), 0),
        }
    }
}

fn routing_schema(name: &str, description: &str, destinations: &[String]) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: format!("{description} Destinations: {}.", destinations.join(", ")),
        parameters: json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "description": format!("One of: {}", destinations.join(", "))
                },
                "task": {
                    "type": "string",
                    "description": "Instructions for the destination agent."
                }
            },
            "required": ["target"]
        }),
    }
}

fn spawn_schema(agents: &[String]) -> ToolSchema {
    ToolSchema {
        name: SPAWN_TOOL.to_string(),
        description: format!(
            "Run a child agent to completion and receive its report. Agents: {}.",
            agents.join(", ")
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "agent": {"type": "string", "description": "Name of the agent to run."},
                "task": {"type": "string", "description": "Task for the child agent."}
            },
            "required": ["agent", "task"]
        }),
    }
}

/// Composes agent sessions into a control-transfer loop. Handoff and router
/// destinations run as fresh sessions after the caller finishes; advisors
/// run before the caller's session and their output is appended as extra
/// user context. Child failures surface as synthesized messages, never as
/// errors out of `run`.
pub struct Orchestrator {
    graph: OrchestrationGraph,
    agents: Arc<BTreeMap<String, AgentDefinition>>,
    providers: Arc<ProviderRegistry>,
    queues: Arc<ToolQueueManager>,
    emitter: Arc<dyn EventEmitter>,
    max_transfers: usize,
    max_spawn_depth: usize,
}

impl Orchestrator {
    pub fn new(providers: Arc<ProviderRegistry>, queues: Arc<ToolQueueManager>) -> Self {
        Self {
            graph: OrchestrationGraph::new(),
            agents: Arc::new(BTreeMap::new()),
            providers,
            queues,
            emitter: Arc::new(NoopEventEmitter),
            max_transfers: 8,
            max_spawn_depth: 3,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_max_transfers(mut self, max_transfers: usize) -> Self {
        self.max_transfers = max_transfers;
        self
    }

    pub fn with_max_spawn_depth(mut self, max_spawn_depth: usize) -> Self {
        self.max_spawn_depth = max_spawn_depth;
        self
    }

    pub fn register_agent(&mut self, def: AgentDefinition) {
        self.graph.add_agent(def.name.clone());
        Arc::make_mut(&mut self.agents).insert(def.name.clone(), def);
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>, kind: EdgeKind) {
        self.graph.add_edge(from, to, kind);
    }

    pub fn graph(&self) -> &OrchestrationGraph {
        &self.graph
    }

    /// Validate the graph, then drive the control-transfer loop starting at
    /// `entry`. Returns the result of the last session in the chain.
    pub async fn run(
        &self,
        entry: &str,
        prompt: &str,
    ) -> Result<SessionResult, OrchestratorError> {
        self.graph.validate()?;
        let spawner = self.spawner();

        let mut current = entry.to_string();
        let mut task = prompt.to_string();
        let mut lineage: Option<(TraceContext, String)> = None;
        let mut transfers = 0usize;

        loop {
            let def = self
                .agents
                .get(&current)
                .ok_or_else(|| OrchestratorError::UnknownAgent(current.clone()))?;

            let advisor_notes = self
                .consult_advisors(&spawner, &current, &task, lineage.clone())
                .await;

            let slot: RoutingSlot = Arc::new(Mutex::new(None));
            let routing = SessionRouting {
                slot: slot.clone(),
                handoff: self.graph.targets(&current, EdgeKind::Handoff),
                router: self.graph.targets(&current, EdgeKind::Router),
            };
            let session =
                spawner.build_session(def, &task, &advisor_notes, lineage.clone(), 0, Some(routing));
            let session_id = session.id().to_string();
            let session_trace = session.trace().clone();
            let result = session.run().await;

            let request = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            match request {
                Some(request) => {
                    transfers += 1;
                    if transfers > self.max_transfers {
                        return Err(OrchestratorError::TransferDepthExceeded(
                            self.max_transfers,
                        ));
                    }
                    tracing::debug!(from = %current, to = %request.target, "control transferred");
                    task = if request.task.is_empty() {
                        result
                            .final_report
                            .map(|report| report.content)
                            .unwrap_or(task)
                    } else {
                        request.task
                    };
                    lineage = Some((session_trace, session_id));
                    current = request.target;
                }
                None => return Ok(result),
            }
        }
    }

    /// Fire-and-forget consultations, awaited together. A failed advisor
    /// becomes a note describing the failure.
    async fn consult_advisors(
        &self,
        spawner: &Arc<ChildSpawner>,
        agent: &str,
        task: &str,
        lineage: Option<(TraceContext, String)>,
    ) -> Vec<String> {
        let advisors = self.graph.targets(agent, EdgeKind::Advisor);
        let consultations = advisors.into_iter().map(|advisor| {
            let spawner = spawner.clone();
            let lineage = lineage.clone();
            async move {
                match spawner.run_child(&advisor, task, lineage, 1).await {
                    Ok(result) if result.success => {
                        let content = result
                            .final_report
                            .map(|report| report.content)
                            .unwrap_or_default();
                        format!("Advice from '{advisor}':\n{content}")
                    }
                    Ok(result) => format!(
                        "Consultation with '{advisor}' failed: {}",
                        result
                            .error
                            .unwrap_or_else(|| "unknown failure".to_string())
                    ),
                    Err(error) => format!("Consultation with '{advisor}' failed: {error}"),
                }
            }
        });
        join_all(consultations).await
    }

    fn spawner(&self) -> Arc<ChildSpawner> {
        Arc::new(ChildSpawner {
            agents: self.agents.clone(),
            providers: self.providers.clone(),
            queues: self.queues.clone(),
            emitter: self.emitter.clone(),
            max_spawn_depth: self.max_spawn_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_agent::FINAL_REPORT_TOOL;
    use keel_llm::{
        Message, ModelProvider, ProviderError, Role, TurnRequest, TurnResult, Usage,
    };
    use std::collections::{HashMap, VecDeque};

    /// Provider that replays per-model scripts; models without remaining
    /// steps return plain text, which fails the turn.
    struct RoutedProvider {
        scripts: Mutex<HashMap<String, VecDeque<TurnResult>>>,
    }

    impl RoutedProvider {
        fn new(scripts: Vec<(&str, Vec<TurnResult>)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(model, steps)| (model.to_string(), steps.into_iter().collect()))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for RoutedProvider {
        fn id(&self) -> &str {
            "test"
        }

        async fn execute_turn(&self, request: TurnRequest) -> Result<TurnResult, ProviderError> {
            let step = self
                .scripts
                .lock()
                .expect("scripts mutex")
                .get_mut(&request.model)
                .and_then(VecDeque::pop_front);
            Ok(step.unwrap_or_else(|| {
                TurnResult::success(
                    vec![Message::assistant("out of script")],
                    Usage::default(),
                    None,
                )
            }))
        }
    }

    fn tool_call(name: &str, arguments: serde_json::Value) -> TurnResult {
        TurnResult::success(
            vec![Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", name, arguments)],
            )],
            Usage::default(),
            Some("tool_use".to_string()),
        )
    }

    fn report(content: &str) -> TurnResult {
        tool_call(
            FINAL_REPORT_TOOL,
            json!({"report_format": "markdown", "report_content": content}),
        )
    }

    fn agent(name: &str, model: &str) -> AgentDefinition {
        AgentDefinition::new(
            name,
            format!("You are {name}."),
            vec![ModelTarget::new("test", model)],
        )
        .with_config(SessionConfig {
            max_retries: 1,
            ..SessionConfig::default()
        })
    }

    fn orchestrator(provider: Arc<RoutedProvider>) -> Orchestrator {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        Orchestrator::new(Arc::new(registry), Arc::new(ToolQueueManager::new(4)))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handoff_transfers_control_and_returns_target_result() {
        let provider = RoutedProvider::new(vec![
            (
                "m-triage",
                vec![
                    tool_call(
                        HANDOFF_TOOL,
                        json!({"target": "specialist", "task": "deep dive"}),
                    ),
                    report("triage summary"),
                ],
            ),
            ("m-specialist", vec![report("specialist findings")]),
        ]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("triage", "m-triage"));
        orch.register_agent(agent("specialist", "m-specialist"));
        orch.add_edge("triage", "specialist", EdgeKind::Handoff);

        let result = orch.run("triage", "investigate").await.expect("run");

        assert!(result.success);
        assert_eq!(
            result.final_report.expect("target report").content,
            "specialist findings"
        );
        let task_message = result
            .conversation
            .iter()
            .find(|message| message.role == Role::User && message.content == "deep dive");
        assert!(task_message.is_some(), "handoff task becomes the new prompt");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn advisor_output_is_appended_and_caller_resumes() {
        let provider = RoutedProvider::new(vec![
            ("m-writer", vec![report("the essay")]),
            ("m-critic", vec![report("Be concise.")]),
        ]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("writer", "m-writer"));
        orch.register_agent(agent("critic", "m-critic"));
        orch.add_edge("writer", "critic", EdgeKind::Advisor);

        let result = orch.run("writer", "write an essay").await.expect("run");

        assert!(result.success);
        assert_eq!(result.final_report.expect("writer report").content, "the essay");
        let note = result
            .conversation
            .iter()
            .find(|message| {
                message.role == Role::User && message.content.contains("Be concise.")
            })
            .expect("advisor note in conversation");
        assert!(note.content.contains("Advice from 'critic'"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_advisor_becomes_synthesized_note() {
        // The critic has no script, so every turn fails until retries run out.
        let provider = RoutedProvider::new(vec![("m-writer", vec![report("the essay")])]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("writer", "m-writer"));
        orch.register_agent(agent("critic", "m-critic"));
        orch.add_edge("writer", "critic", EdgeKind::Advisor);

        let result = orch.run("writer", "write an essay").await.expect("run");

        assert!(result.success, "advisor failure never fails the caller");
        let note = result
            .conversation
            .iter()
            .find(|message| message.content.contains("Consultation with 'critic' failed"))
            .expect("failure note in conversation");
        assert_eq!(note.role, Role::User);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn spawn_tool_returns_child_report_as_tool_result() {
        let provider = RoutedProvider::new(vec![
            (
                "m-lead",
                vec![
                    tool_call(SPAWN_TOOL, json!({"agent": "helper", "task": "compute"})),
                    report("lead done"),
                ],
            ),
            ("m-helper", vec![report("42")]),
        ]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("lead", "m-lead"));
        orch.register_agent(agent("helper", "m-helper"));

        let result = orch.run("lead", "solve it").await.expect("run");

        assert!(result.success);
        let tool_message = result
            .conversation
            .iter()
            .find(|message| message.role == Role::Tool)
            .expect("spawn result in conversation");
        assert_eq!(tool_message.content, "42");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn spawn_depth_limit_stops_nested_spawning() {
        let provider = RoutedProvider::new(vec![
            (
                "m-lead",
                vec![
                    tool_call(SPAWN_TOOL, json!({"agent": "helper", "task": "delegate"})),
                    report("lead done"),
                ],
            ),
            (
                "m-helper",
                vec![tool_call(SPAWN_TOOL, json!({"agent": "gofer", "task": "dig"}))],
            ),
            ("m-gofer", vec![report("gofer findings")]),
        ]);
        let probe = provider.clone();
        let mut orch = orchestrator(provider).with_max_spawn_depth(1);
        orch.register_agent(agent("lead", "m-lead"));
        orch.register_agent(agent("helper", "m-helper"));
        orch.register_agent(agent("gofer", "m-gofer"));

        let result = orch.run("lead", "solve it").await.expect("run");

        assert!(result.success);
        assert_eq!(
            result.final_report.expect("lead report").content,
            "lead done"
        );
        let failure = result
            .conversation
            .iter()
            .find(|message| message.role == Role::Tool)
            .expect("spawn outcome in conversation");
        assert!(
            failure.content.contains("child agent 'helper' failed"),
            "helper must not spawn past the depth limit: {}",
            failure.content
        );
        let gofer_steps = probe
            .scripts
            .lock()
            .expect("scripts mutex")
            .get("m-gofer")
            .map(VecDeque::len);
        assert_eq!(gofer_steps, Some(1), "the grandchild never ran");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cyclic_control_graph_is_rejected_before_running() {
        let provider = RoutedProvider::new(vec![]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("triage", "m-triage"));
        orch.register_agent(agent("specialist", "m-specialist"));
        orch.add_edge("triage", "specialist", EdgeKind::Handoff);
        orch.add_edge("specialist", "triage", EdgeKind::Handoff);

        let error = orch
            .run("triage", "investigate")
            .await
            .expect_err("cycle must be rejected");
        assert!(matches!(error, OrchestratorError::CycleDetected { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn route_to_undeclared_target_is_refused() {
        let provider = RoutedProvider::new(vec![
            (
                "m-router",
                vec![
                    tool_call(ROUTE_TOOL, json!({"target": "ghost"})),
                    report("stayed put"),
                ],
            ),
            ("m-sink", vec![report("sink report")]),
        ]);
        let mut orch = orchestrator(provider);
        orch.register_agent(agent("router", "m-router"));
        orch.register_agent(agent("sink", "m-sink"));
        orch.add_edge("router", "sink", EdgeKind::Router);

        let result = orch.run("router", "go").await.expect("run");

        assert_eq!(
            result.final_report.expect("own report").content,
            "stayed put",
            "no transfer happened"
        );
        let refusal = result
            .conversation
            .iter()
            .find(|message| message.content.contains("not a declared destination"))
            .expect("refusal fed back to the model");
        assert_eq!(refusal.role, Role::Tool);
    }
}
