use crate::errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Handoff,
    Router,
    Advisor,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Handoff => "handoff",
            EdgeKind::Router => "router",
            EdgeKind::Advisor => "advisor",
        }
    }

    /// Handoff and router edges transfer control; advisor edges never do.
    pub fn transfers_control(&self) -> bool {
        matches!(self, EdgeKind::Handoff | EdgeKind::Router)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEdge {
    pub to: String,
    pub kind: EdgeKind,
}

/// Declared agents and their outgoing edges. Built once at load time,
/// validated before any session runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationGraph {
    agents: BTreeSet<String>,
    edges: BTreeMap<String, Vec<AgentEdge>>,
}

impl OrchestrationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&mut self, id: impl Into<String>) {
        self.agents.insert(id.into());
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>, kind: EdgeKind) {
        self.edges.entry(from.into()).or_default().push(AgentEdge {
            to: to.into(),
            kind,
        });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains(id)
    }

    /// Edge targets of one kind, in declaration order.
    pub fn targets(&self, from: &str, kind: EdgeKind) -> Vec<String> {
        self.edges
            .get(from)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|edge| edge.kind == kind)
                    .map(|edge| edge.to.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build-time validation: every edge endpoint must be a registered
    /// agent, and the control graph (handoff + router edges) must be
    /// acyclic.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        for (from, edges) in &self.edges {
            if !self.agents.contains(from) {
                return Err(OrchestratorError::UnknownAgent(from.clone()));
            }
            for edge in edges {
                if !self.agents.contains(&edge.to) {
                    return Err(OrchestratorError::UnknownEdgeTarget {
                        from: from.clone(),
                        to: edge.to.clone(),
                    });
                }
            }
        }
        match self.find_control_cycle() {
            Some(path) => Err(OrchestratorError::CycleDetected { path }),
            None => Ok(()),
        }
    }

    fn control_targets(&self, from: &str) -> Vec<&str> {
        self.edges
            .get(from)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|edge| edge.kind.transfers_control())
                    .map(|edge| edge.to.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Depth-first cycle search over the control edges. Iterative with an
    /// explicit stack so adversarial graph depth cannot overflow the call
    /// stack; returns the offending path when a cycle exists.
    pub fn find_control_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<&str, Color> = self
            .agents
            .iter()
            .map(|id| (id.as_str(), Color::White))
            .collect();

        for start in &self.agents {
            if color.get(start.as_str()) != Some(&Color::White) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            color.insert(start.as_str(), Color::Gray);

            while let Some(&(node, index)) = stack.last() {
                let targets = self.control_targets(node);
                if index >= targets.len() {
                    stack.pop();
                    color.insert(node, Color::Black);
                    continue;
                }
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                let next = targets[index];
                match color.get(next).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(next, Color::Gray);
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let from = stack
                            .iter()
                            .position(|(id, _)| *id == next)
                            .unwrap_or_default();
                        let mut path: Vec<String> =
                            stack[from..].iter().map(|(id, _)| id.to_string()).collect();
                        path.push(next.to_string());
                        return Some(path);
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(agents: &[&str], edges: &[(&str, &str, EdgeKind)]) -> OrchestrationGraph {
        let mut graph = OrchestrationGraph::new();
        for agent in agents {
            graph.add_agent(*agent);
        }
        for (from, to, kind) in edges {
            graph.add_edge(*from, *to, *kind);
        }
        graph
    }

    #[test]
    fn mutual_handoff_reports_cycle_with_both_ids() {
        let graph = graph_with(
            &["a", "b"],
            &[
                ("a", "b", EdgeKind::Handoff),
                ("b", "a", EdgeKind::Handoff),
            ],
        );
        let error = graph.validate().expect_err("cycle expected");
        let OrchestratorError::CycleDetected { path } = error else {
            panic!("expected CycleDetected, got {error:?}");
        };
        assert!(path.contains(&"a".to_string()));
        assert!(path.contains(&"b".to_string()));
    }

    #[test]
    fn mutual_advisor_edges_are_not_a_cycle() {
        let graph = graph_with(
            &["a", "b"],
            &[
                ("a", "b", EdgeKind::Advisor),
                ("b", "a", EdgeKind::Advisor),
            ],
        );
        assert!(graph.validate().is_ok());
        assert!(graph.find_control_cycle().is_none());
    }

    #[test]
    fn handoff_router_union_is_searched() {
        let graph = graph_with(
            &["a", "b", "c"],
            &[
                ("a", "b", EdgeKind::Handoff),
                ("b", "c", EdgeKind::Router),
                ("c", "a", EdgeKind::Router),
            ],
        );
        let path = graph.find_control_cycle().expect("cycle expected");
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn self_handoff_is_a_cycle() {
        let graph = graph_with(&["a"], &[("a", "a", EdgeKind::Handoff)]);
        let path = graph.find_control_cycle().expect("cycle expected");
        assert_eq!(path, vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn acyclic_chain_validates() {
        let graph = graph_with(
            &["a", "b", "c"],
            &[
                ("a", "b", EdgeKind::Handoff),
                ("b", "c", EdgeKind::Router),
                ("a", "c", EdgeKind::Advisor),
            ],
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn undeclared_edge_target_is_rejected() {
        let graph = graph_with(&["a"], &[("a", "ghost", EdgeKind::Handoff)]);
        assert!(matches!(
            graph.validate(),
            Err(OrchestratorError::UnknownEdgeTarget { .. })
        ));
    }
}
