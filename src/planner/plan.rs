//! Diffing a compiled graph against the previously applied one.
//!
//! Nodes are matched by their logical key, ignoring color. A matched node
//! is updated in place; anything that must be rebuilt gets the other color
//! so the replacement and its predecessor can coexist in one graph.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

use super::hash::NodeHasher;
use crate::expression::replace_refs_with_output_values;
use crate::graph::{
    GraphEdge, GraphNode, InfraGraph, InfraGraphNode, NodeAction, NodeKey, NodeState, NodeStatus,
};

/// Builds planned graphs.
#[derive(Debug, Default)]
pub struct GraphPlanner {
    hasher: NodeHasher,
}

/// Prior update candidate for no-op detection.
struct NoOpCandidate {
    id: String,
    prior_hash: String,
    outputs: Option<Value>,
    state: Option<Value>,
}

impl GraphPlanner {
    /// Creates a planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: NodeHasher::new(),
        }
    }

    /// Plans the transition from `before` (last applied) to `after` (freshly
    /// compiled).
    ///
    /// Every node in the result is `pending` except no-ops, which are
    /// `complete` and carry their previous outputs.
    #[must_use]
    pub fn plan(&self, before: &InfraGraph, after: &InfraGraph) -> InfraGraph {
        let mut planned = InfraGraph::new();
        let mut replacements: HashMap<String, String> = HashMap::new();
        let mut renamed: HashMap<String, String> = HashMap::new();
        let mut candidates = Vec::new();

        for node in after.nodes() {
            let previous = find_previous(before, node.key());
            let recreate = previous.is_none_or(|prev| {
                prev.action == NodeAction::Delete
                    || (prev.action == NodeAction::Create && !prev.is_complete())
            });

            let mut next = node.clone();
            next.status = NodeStatus::pending();
            next.outputs = None;

            if recreate {
                next.action = NodeAction::Create;
                if let Some(prev) = previous {
                    next = next.with_color(prev.color().flipped());
                    // A create that failed half way may have left state behind.
                    if prev.action == NodeAction::Create {
                        next.state.clone_from(&prev.state);
                    }
                }
            } else if let Some(prev) = previous {
                next.action = NodeAction::Update;
                next = next.with_color(prev.color());
                next.state.clone_from(&prev.state);

                if prev.is_complete() {
                    candidates.push(NoOpCandidate {
                        id: next.id(),
                        prior_hash: self.hasher.hash_node(prev),
                        outputs: prev.outputs.clone(),
                        state: prev.state.clone(),
                    });
                }
                renamed.insert(prev.id(), next.id());
            }

            replacements.insert(node.id(), next.id());
            debug!("Planned {} as {}", next.id(), next.action);
            planned.insert_node(next);
        }

        planned.insert_edges(after.edges().cloned());
        planned.replace_node_refs(&replacements);

        let kept_keys: HashSet<&NodeKey> = after.nodes().map(InfraGraphNode::key).collect();
        let mut deletes = Vec::new();
        for prev in before.nodes() {
            let completed_delete = prev.action == NodeAction::Delete && prev.is_complete();
            if completed_delete {
                continue;
            }

            if kept_keys.contains(prev.key()) {
                // The old incarnation of a recreated node still has to go.
                if prev.action != NodeAction::Delete {
                    continue;
                }
            } else if prev.action == NodeAction::Create
                && prev.status.state == NodeState::Pending
            {
                continue;
            }

            let mut delete = prev.clone().with_action(NodeAction::Delete);
            delete.status = NodeStatus::pending();
            let id = delete.id();
            if planned.contains(&id) {
                warn!("Skipping delete of {id}: the id is taken by a planned node");
                continue;
            }
            deletes.push((id, prev.action));
            planned.insert_node(delete);
        }

        let resolve_id = |id: &str| renamed.get(id).cloned().unwrap_or_else(|| id.to_string());
        let mut delete_edges = Vec::new();
        for (id, previous_action) in &deletes {
            if *previous_action == NodeAction::Delete {
                delete_edges.extend(
                    before
                        .edges()
                        .filter(|edge| edge.from == *id)
                        .map(|edge| GraphEdge::new(id.clone(), resolve_id(&edge.to))),
                );
            } else {
                // Destroy dependents before their dependencies.
                delete_edges.extend(
                    before
                        .edges()
                        .filter(|edge| edge.to == *id)
                        .map(|edge| GraphEdge::new(id.clone(), resolve_id(&edge.from))),
                );
            }
        }
        delete_edges.retain(|edge| planned.contains(&edge.to));
        planned.insert_edges(delete_edges);

        self.detect_no_ops(&mut planned, candidates);
        planned
    }

    /// Downgrades updates whose resolved content matches the last apply.
    ///
    /// Inputs are resolved against neighbours already known to be no-ops,
    /// repeating until nothing changes so unchanged chains collapse.
    fn detect_no_ops(&self, graph: &mut InfraGraph, mut candidates: Vec<NoOpCandidate>) {
        loop {
            let outputs: HashMap<String, Value> = graph
                .nodes()
                .filter(|node| node.action == NodeAction::NoOp)
                .filter_map(|node| node.outputs.clone().map(|outputs| (node.id(), outputs)))
                .collect();

            let mut changed = false;
            candidates.retain(|candidate| {
                let Some(node) = graph.node_mut(&candidate.id) else {
                    return false;
                };
                let Ok(inputs) = replace_refs_with_output_values(&node.inputs, &outputs) else {
                    return true;
                };
                let hash = self.hasher.hash_parts(node.plugin, &node.image, &inputs);
                if !NodeHasher::hashes_match(&hash, &candidate.prior_hash) {
                    return false;
                }

                debug!(
                    "{} unchanged ({}), marking no-op",
                    candidate.id,
                    self.hasher.short_hash(&hash)
                );
                node.inputs = inputs;
                node.action = NodeAction::NoOp;
                node.status = NodeStatus::complete();
                node.outputs.clone_from(&candidate.outputs);
                node.state.clone_from(&candidate.state);
                changed = true;
                false
            });

            if !changed {
                break;
            }
        }
    }
}

/// The prior incarnation of `key`: the live node if there is one, else a
/// pending delete.
fn find_previous<'a>(before: &'a InfraGraph, key: &NodeKey) -> Option<&'a InfraGraphNode> {
    let mut matches = before.nodes().filter(|node| node.key() == key);
    let first = matches.next()?;
    if first.action != NodeAction::Delete {
        return Some(first);
    }
    Some(matches.find(|node| node.action != NodeAction::Delete).unwrap_or(first))
}

/// Counts of planned actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// When the summary was taken.
    pub created_at: DateTime<Utc>,
    /// Nodes to create.
    pub creates: usize,
    /// Nodes to update.
    pub updates: usize,
    /// Nodes to delete.
    pub deletes: usize,
    /// Unchanged nodes.
    pub no_ops: usize,
}

impl PlanSummary {
    /// Summarises a planned graph.
    #[must_use]
    pub fn from_graph(graph: &InfraGraph) -> Self {
        let count = |action: NodeAction| graph.nodes().filter(|n| n.action == action).count();
        Self {
            created_at: Utc::now(),
            creates: count(NodeAction::Create),
            updates: count(NodeAction::Update),
            deletes: count(NodeAction::Delete),
            no_ops: count(NodeAction::NoOp),
        }
    }

    /// Returns true if applying the plan would invoke any plugin.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.deletes > 0
    }

    /// Number of nodes that will be applied.
    #[must_use]
    pub const fn change_count(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }
        write!(
            f,
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            self.creates, self.updates, self.deletes, self.no_ops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginKind;
    use serde_json::json;

    fn node(name: &str, action: NodeAction, state: NodeState, inputs: Value) -> InfraGraphNode {
        let mut node = InfraGraphNode::new(
            NodeKey::new("module", name),
            "test-module:test-tag",
            PluginKind::Pulumi,
        )
        .with_inputs(inputs)
        .with_action(action);
        node.status.state = state;
        node
    }

    fn simple(name: &str, action: NodeAction, state: NodeState) -> InfraGraphNode {
        node(name, action, state, json!({ "name": "test" }))
    }

    fn fresh(name: &str) -> InfraGraphNode {
        simple(name, NodeAction::Create, NodeState::Pending)
    }

    fn graph(nodes: Vec<InfraGraphNode>, edges: Vec<GraphEdge>) -> InfraGraph {
        InfraGraph::from_parts(nodes, edges)
    }

    fn actions(graph: &InfraGraph) -> Vec<NodeAction> {
        graph.nodes().map(|n| n.action).collect()
    }

    #[test]
    fn test_schedules_new_nodes_for_creation() {
        let planned = GraphPlanner::new().plan(&InfraGraph::new(), &graph(vec![fresh("test")], vec![]));

        assert_eq!(actions(&planned), vec![NodeAction::Create]);
        assert_eq!(planned.nodes().next().map(|n| n.status.state), Some(NodeState::Pending));
    }

    #[test]
    fn test_schedules_old_nodes_for_deletion() {
        let before = graph(vec![simple("test", NodeAction::Create, NodeState::Complete)], vec![]);
        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());

        assert_eq!(actions(&planned), vec![NodeAction::Delete]);
    }

    #[test]
    fn test_retries_failed_deletes_only() {
        let before = graph(
            vec![
                simple("test", NodeAction::Delete, NodeState::Complete),
                simple("test-2", NodeAction::Delete, NodeState::Error),
            ],
            vec![],
        );
        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());

        assert_eq!(actions(&planned), vec![NodeAction::Delete]);
        assert_eq!(planned.nodes().next().map(|n| n.key().name()), Some("test-2"));
    }

    #[test]
    fn test_deletes_errored_create_but_not_pending_create() {
        let before = graph(
            vec![
                simple("errored", NodeAction::Create, NodeState::Error),
                simple("never-ran", NodeAction::Create, NodeState::Pending),
            ],
            vec![],
        );
        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());

        assert_eq!(planned.len(), 1);
        assert_eq!(planned.nodes().next().map(|n| n.key().name()), Some("errored"));
    }

    #[test]
    fn test_unchanged_leaf_update_is_no_op() {
        let inputs = json!({ "input1": "foo", "input2": "bar" });
        let mut previous = node("test", NodeAction::Update, NodeState::Complete, inputs.clone());
        previous.outputs = Some(json!({ "id": "123" }));
        previous.state = Some(json!("opaque"));
        let before = graph(vec![previous], vec![]);

        let planned = GraphPlanner::new().plan(
            &before,
            &graph(vec![node("test", NodeAction::Create, NodeState::Pending, inputs)], vec![]),
        );

        let only = planned.nodes().next().expect("one node");
        assert_eq!(only.action, NodeAction::NoOp);
        assert_eq!(only.status.state, NodeState::Complete);
        assert_eq!(only.outputs, Some(json!({ "id": "123" })));
        assert_eq!(only.state, Some(json!("opaque")));
    }

    #[test]
    fn test_changed_inputs_update() {
        let before = graph(
            vec![node("test", NodeAction::Update, NodeState::Complete, json!({ "a": 1 }))],
            vec![],
        );
        let planned = GraphPlanner::new().plan(
            &before,
            &graph(vec![node("test", NodeAction::Create, NodeState::Pending, json!({ "a": 2 }))], vec![]),
        );

        let only = planned.nodes().next().expect("one node");
        assert_eq!(only.action, NodeAction::Update);
        assert_eq!(only.status.state, NodeState::Pending);
    }

    #[test]
    fn test_retries_unfinished_creates_and_updates() {
        let before = graph(
            vec![
                simple("test", NodeAction::Create, NodeState::Pending),
                simple("test-2", NodeAction::Create, NodeState::Error),
                simple("test-3", NodeAction::Update, NodeState::Pending),
            ],
            vec![],
        );
        let after = graph(vec![fresh("test"), fresh("test-2"), fresh("test-3")], vec![]);
        let planned = GraphPlanner::new().plan(&before, &after);

        assert_eq!(
            actions(&planned),
            vec![NodeAction::Create, NodeAction::Create, NodeAction::Update]
        );
    }

    #[test]
    fn test_recreated_nodes_flip_color_and_rewrite_refs() {
        let vpc = simple("vpc", NodeAction::Create, NodeState::Error);
        let before = graph(vec![vpc], vec![]);

        let after_vpc = fresh("vpc");
        let cluster = node(
            "cluster",
            NodeAction::Create,
            NodeState::Pending,
            json!({ "vpc": "${{ module/vpc@blue.id }}" }),
        );
        let after = graph(
            vec![after_vpc, cluster],
            vec![GraphEdge::new("module/cluster@blue", "module/vpc@blue")],
        );

        let planned = GraphPlanner::new().plan(&before, &after);
        assert!(planned.contains("module/vpc@green"));
        let cluster = planned.node("module/cluster@blue").expect("cluster");
        assert_eq!(cluster.inputs["vpc"], "${{ module/vpc@green.id }}");
        assert!(planned.has_edge("module/cluster@blue", "module/vpc@green"));
    }

    #[test]
    fn test_updates_keep_color() {
        let before = graph(
            vec![simple("vpc", NodeAction::Create, NodeState::Complete).with_color(crate::graph::NodeColor::Green)],
            vec![],
        );
        let planned = GraphPlanner::new().plan(
            &before,
            &graph(vec![node("vpc", NodeAction::Create, NodeState::Pending, json!({ "changed": true }))], vec![]),
        );
        let vpc = planned.node("module/vpc@green").expect("color carried");
        assert_eq!(vpc.action, NodeAction::Update);
    }

    #[test]
    fn test_reverses_edges_when_removing_nodes() {
        let a = simple("nodeA", NodeAction::Update, NodeState::Complete);
        let b = simple("nodeB", NodeAction::Update, NodeState::Complete);
        let c = simple("nodeC", NodeAction::Create, NodeState::Complete);
        let ab = GraphEdge::new(a.id(), b.id());
        let bc = GraphEdge::new(b.id(), c.id());
        let before = graph(vec![a, b, c], vec![ab.clone(), bc.clone()]);

        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());

        assert_eq!(actions(&planned), vec![NodeAction::Delete; 3]);
        assert_eq!(planned.edge_count(), 2);
        assert!(planned.has_edge(&ab.to, &ab.from));
        assert!(planned.has_edge(&bc.to, &bc.from));
    }

    #[test]
    fn test_keeps_edges_of_pending_deletes() {
        let a = simple("nodeA", NodeAction::Delete, NodeState::Pending);
        let b = simple("nodeB", NodeAction::Delete, NodeState::Pending);
        let c = simple("nodeC", NodeAction::Delete, NodeState::Pending);
        let ab = GraphEdge::new(a.id(), b.id());
        let bc = GraphEdge::new(b.id(), c.id());
        let before = graph(vec![a, b, c], vec![ab.clone(), bc.clone()]);

        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());

        assert_eq!(actions(&planned), vec![NodeAction::Delete; 3]);
        assert_eq!(planned.edge_count(), 2);
        assert!(planned.has_edge(&ab.from, &ab.to));
        assert!(planned.has_edge(&bc.from, &bc.to));
    }

    #[test]
    fn test_prunes_delete_edges_to_completed_deletes() {
        let a = simple("nodeA", NodeAction::Delete, NodeState::Pending);
        let b = simple("nodeB", NodeAction::Delete, NodeState::Complete);
        let ab = GraphEdge::new(a.id(), b.id());
        let before = graph(vec![a, b], vec![ab]);

        let planned = GraphPlanner::new().plan(&before, &InfraGraph::new());
        assert_eq!(planned.len(), 1);
        assert_eq!(planned.edge_count(), 0);
    }

    #[test]
    fn test_pending_delete_of_recreated_key_is_carried_forward() {
        let before = graph(vec![simple("vpc", NodeAction::Delete, NodeState::Error)], vec![]);
        let planned = GraphPlanner::new().plan(&before, &graph(vec![fresh("vpc")], vec![]));

        assert_eq!(planned.len(), 2);
        assert_eq!(planned.node("module/vpc@green").map(|n| n.action), Some(NodeAction::Create));
        assert_eq!(planned.node("module/vpc@blue").map(|n| n.action), Some(NodeAction::Delete));
    }

    #[test]
    fn test_unchanged_chains_collapse_to_no_op() {
        let mut vpc = simple("vpc", NodeAction::Create, NodeState::Complete);
        vpc.outputs = Some(json!({ "id": "vpc-1" }));
        let mut cluster = node("cluster", NodeAction::Create, NodeState::Complete, json!({ "vpc": "vpc-1" }));
        cluster.outputs = Some(json!({ "name": "k8s" }));
        let before = graph(
            vec![vpc, cluster],
            vec![GraphEdge::new("module/cluster@blue", "module/vpc@blue")],
        );

        let after = graph(
            vec![
                node("cluster", NodeAction::Create, NodeState::Pending, json!({ "vpc": "${{ module/vpc@blue.id }}" })),
                fresh("vpc"),
            ],
            vec![GraphEdge::new("module/cluster@blue", "module/vpc@blue")],
        );

        let planned = GraphPlanner::new().plan(&before, &after);
        assert_eq!(actions(&planned), vec![NodeAction::NoOp, NodeAction::NoOp]);
        let summary = PlanSummary::from_graph(&planned);
        assert!(!summary.has_changes());
        assert_eq!(summary.to_string(), "No changes required");
    }

    #[test]
    fn test_plan_summary_counts() {
        let before = graph(vec![simple("old", NodeAction::Create, NodeState::Complete)], vec![]);
        let planned = GraphPlanner::new().plan(&before, &graph(vec![fresh("new")], vec![]));

        let summary = PlanSummary::from_graph(&planned);
        assert_eq!((summary.creates, summary.updates, summary.deletes, summary.no_ops), (1, 0, 1, 0));
        assert_eq!(summary.change_count(), 2);
        assert_eq!(summary.to_string(), "Plan: 1 to create, 0 to update, 1 to delete, 0 unchanged");
    }
}
