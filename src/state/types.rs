//! Persisted state records.
//!
//! The last applied infrastructure graph is stored per datacenter, and per
//! environment within a datacenter. It becomes the `before` graph of the next
//! plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::{InfraGraph, NodeAction, NodeState};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept per record.
pub const MAX_HISTORY: usize = 100;

/// Identifies one persisted graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    /// Datacenter name.
    pub datacenter: String,
    /// Environment name, for environment graphs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl StateKey {
    /// Key of a datacenter graph.
    #[must_use]
    pub fn datacenter(name: impl Into<String>) -> Self {
        Self {
            datacenter: name.into(),
            environment: None,
        }
    }

    /// Key of an environment graph.
    #[must_use]
    pub fn environment(datacenter: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            environment: Some(environment.into()),
        }
    }

    /// Relative path of the record, shared by every backend.
    #[must_use]
    pub fn relative_path(&self) -> String {
        match &self.environment {
            Some(environment) => {
                format!("{}/environments/{environment}.json", self.datacenter)
            }
            None => format!("{}/datacenter.json", self.datacenter),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.environment {
            Some(environment) => write!(f, "{}/{environment}", self.datacenter),
            None => write!(f, "{}", self.datacenter),
        }
    }
}

/// A persisted graph and its apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// State format version.
    pub version: String,
    /// What this record belongs to.
    pub key: StateKey,
    /// The last applied (or partially applied) graph.
    pub graph: InfraGraph,
    /// When the record was last written.
    pub last_updated: DateTime<Utc>,
    /// Recent applies, oldest first.
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

impl StateRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(key: StateKey) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            key,
            graph: InfraGraph::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Replaces the graph.
    pub fn set_graph(&mut self, graph: InfraGraph) {
        self.graph = graph;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Most recent history entry.
    #[must_use]
    pub fn last_apply(&self) -> Option<&ApplyHistoryEntry> {
        self.history.last()
    }

    /// Ids of nodes that failed in the last run.
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<String> {
        use crate::graph::GraphNode;
        self.graph
            .nodes()
            .filter(|node| node.status.state == NodeState::Error)
            .map(GraphNode::id)
            .collect()
    }

    /// Returns true if the last run finished every node.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.graph
            .nodes()
            .all(|node| node.is_complete() || node.action == NodeAction::NoOp)
    }
}

/// One apply, as recorded in the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the apply finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Node ids the plan touched.
    pub nodes: Vec<String>,
    /// Whether the apply succeeded.
    pub success: bool,
    /// Error message of a failed apply.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// A plan was applied.
    Apply,
    /// Everything was destroyed.
    Destroy,
}

impl ApplyHistoryEntry {
    /// Creates a successful entry.
    #[must_use]
    pub fn new(operation: ApplyOperation, nodes: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            nodes,
            success: true,
            error: None,
        }
    }

    /// Creates a failed entry.
    #[must_use]
    pub fn failed(operation: ApplyOperation, nodes: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            nodes,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InfraGraphNode, NodeKey, NodeStatus};
    use crate::plugin::PluginKind;

    #[test]
    fn test_key_paths() {
        assert_eq!(StateKey::datacenter("dc").relative_path(), "dc/datacenter.json");
        assert_eq!(
            StateKey::environment("dc", "prod").relative_path(),
            "dc/environments/prod.json"
        );
        assert_eq!(StateKey::environment("dc", "prod").to_string(), "dc/prod");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut record = StateRecord::new(StateKey::datacenter("dc"));
        for i in 0..(MAX_HISTORY + 5) {
            record.add_history(ApplyHistoryEntry::new(ApplyOperation::Apply, vec![i.to_string()]));
        }
        assert_eq!(record.history.len(), MAX_HISTORY);
        assert_eq!(record.history[0].nodes, vec!["5".to_string()]);
        assert_eq!(record.last_apply().map(|e| e.success), Some(true));
    }

    #[test]
    fn test_failed_nodes_and_settled() {
        let mut record = StateRecord::new(StateKey::datacenter("dc"));
        assert!(record.is_settled());

        let mut node = InfraGraphNode::new(NodeKey::new("module", "vpc"), "img", PluginKind::Pulumi);
        node.status.transition(NodeState::Error, Some("boom".to_string()));
        let mut ok = InfraGraphNode::new(NodeKey::new("module", "dns"), "img", PluginKind::Pulumi);
        ok.status = NodeStatus::complete();
        record.set_graph(InfraGraph::from_parts(vec![node, ok], vec![]));

        assert_eq!(record.failed_nodes(), vec!["module/vpc@blue".to_string()]);
        assert!(!record.is_settled());
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let mut record = StateRecord::new(StateKey::environment("dc", "prod"));
        record.add_history(ApplyHistoryEntry::failed(ApplyOperation::Apply, vec![], "boom"));
        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: StateRecord = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.key, record.key);
        assert_eq!(parsed.history[0].error.as_deref(), Some("boom"));
    }
}
