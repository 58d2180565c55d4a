use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The offending path is included so a misconfigured graph can be read
    /// straight out of the error.
    #[error("cycle detected in orchestration graph: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("edge target '{to}' declared by '{from}' is not a registered agent")]
    UnknownEdgeTarget { from: String, to: String },
    #[error("control transferred more than {0} times without completing")]
    TransferDepthExceeded(usize),
}
