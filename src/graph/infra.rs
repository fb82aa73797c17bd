//! The infrastructure graph: provisioning operations and their progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;

use super::{Graph, GraphEdge, GraphNode, NodeKey};
use crate::expression::refs::split_reference;
use crate::expression::template::{map_expressions, render_token, visit_expressions};
use crate::plugin::PluginKind;

/// Planned operation for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeAction {
    /// Provision a new resource.
    Create,
    /// Re-apply an existing resource.
    Update,
    /// Destroy an existing resource.
    Delete,
    /// Nothing changed since the last apply.
    NoOp,
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

/// Incarnation tag that lets a replacement coexist with its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeColor {
    /// First incarnation.
    #[default]
    Blue,
    /// Alternate incarnation.
    Green,
}

impl NodeColor {
    /// Returns the other color.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }
}

impl fmt::Display for NodeColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blue => write!(f, "blue"),
            Self::Green => write!(f, "green"),
        }
    }
}

/// Execution state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Waiting to be applied.
    #[default]
    Pending,
    /// Dispatched, plugin not yet working.
    Starting,
    /// Plugin is creating or updating.
    Applying,
    /// Plugin is destroying.
    Destroying,
    /// Finished successfully.
    Complete,
    /// Failed.
    Error,
    /// Unknown, typically after an interrupted run.
    Unknown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Applying => "applying",
            Self::Destroying => "destroying",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Execution status of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Current state.
    pub state: NodeState,
    /// Failure or progress message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the apply started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the apply finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Last state change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl NodeStatus {
    /// A fresh pending status.
    #[must_use]
    pub fn pending() -> Self {
        Self::default()
    }

    /// A complete status with no run timestamps.
    #[must_use]
    pub fn complete() -> Self {
        Self {
            state: NodeState::Complete,
            last_updated: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Moves to `state`, stamping start and end times as appropriate.
    pub fn transition(&mut self, state: NodeState, message: Option<String>) {
        let now = Utc::now();
        match state {
            NodeState::Starting | NodeState::Applying | NodeState::Destroying => {
                if self.start_time.is_none() || self.state == NodeState::Pending {
                    self.start_time = Some(now);
                    self.end_time = None;
                }
            }
            NodeState::Complete | NodeState::Error => self.end_time = Some(now),
            NodeState::Pending | NodeState::Unknown => {}
        }
        self.state = state;
        self.message = message;
        self.last_updated = Some(now);
    }
}

/// One provisioning operation backed by a module image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraGraphNode {
    #[serde(flatten)]
    key: NodeKey,
    #[serde(default)]
    color: NodeColor,
    /// App node this module was instantiated for by a resource hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_node_id: Option<String>,
    /// Module image (or build directory before building).
    pub image: String,
    /// Provisioning backend.
    #[serde(default)]
    pub plugin: PluginKind,
    /// Module inputs, possibly containing `${{ id.key }}` references.
    #[serde(default)]
    pub inputs: Value,
    /// Planned operation.
    pub action: NodeAction,
    /// Execution status.
    #[serde(default)]
    pub status: NodeStatus,
    /// Outputs returned by the plugin once complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Opaque provisioning state returned by the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl InfraGraphNode {
    /// Creates a pending `create` node in the default color.
    #[must_use]
    pub fn new(key: NodeKey, image: impl Into<String>, plugin: PluginKind) -> Self {
        Self {
            key,
            color: NodeColor::default(),
            app_node_id: None,
            image: image.into(),
            plugin,
            inputs: Value::Object(Map::new()),
            action: NodeAction::Create,
            status: NodeStatus::pending(),
            outputs: None,
            state: None,
        }
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the planned action.
    #[must_use]
    pub fn with_action(mut self, action: NodeAction) -> Self {
        self.action = action;
        self
    }

    /// Rebuilds the node under a different color, which changes its id.
    #[must_use]
    pub fn with_color(mut self, color: NodeColor) -> Self {
        self.color = color;
        self
    }

    /// Records the app node that owns this module.
    #[must_use]
    pub fn with_app_node(mut self, app_node_id: impl Into<String>) -> Self {
        self.app_node_id = Some(app_node_id.into());
        self
    }

    /// Logical identity, shared by every incarnation.
    #[must_use]
    pub const fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Incarnation color.
    #[must_use]
    pub const fn color(&self) -> NodeColor {
        self.color
    }

    /// Returns true once the node has been applied successfully.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status.state == NodeState::Complete
    }

    /// Ids referenced by `${{ id.key }}` tokens in the inputs.
    #[must_use]
    pub fn referenced_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        visit_expressions(&self.inputs, &mut |expr| {
            if let Some((id, _)) = split_reference(expr) {
                if !ids.iter().any(|known| known == id) {
                    ids.push(id.to_string());
                }
            }
        });
        ids
    }
}

impl GraphNode for InfraGraphNode {
    fn id(&self) -> String {
        format!("{}@{}", self.key, self.color)
    }
}

/// Graph of provisioning operations.
pub type InfraGraph = Graph<InfraGraphNode>;

impl Graph<InfraGraphNode> {
    /// Nodes ready to run: not complete, with every dependency complete.
    ///
    /// Ordered by `(environment, component)`; ties keep graph order.
    #[must_use]
    pub fn get_queue(&self) -> Vec<&InfraGraphNode> {
        let mut queue: Vec<&InfraGraphNode> = self
            .nodes()
            .filter(|node| !node.is_complete())
            .filter(|node| {
                let id = node.id();
                self.edges()
                    .filter(|edge| edge.from == id)
                    .all(|edge| self.node(&edge.to).is_some_and(InfraGraphNode::is_complete))
            })
            .collect();
        queue.sort_by(|a, b| {
            (a.key.environment(), a.key.component()).cmp(&(b.key.environment(), b.key.component()))
        });
        queue
    }

    /// Outputs of every complete node, keyed by node id.
    #[must_use]
    pub fn completed_outputs(&self) -> HashMap<String, Value> {
        self.nodes()
            .filter(|node| node.is_complete())
            .filter_map(|node| node.outputs.clone().map(|outputs| (node.id(), outputs)))
            .collect()
    }

    /// Rewrites node ids in every reference token and every edge.
    ///
    /// All replacements are applied in a single pass, so chains like
    /// `a -> b, b -> a` swap cleanly.
    pub fn replace_node_refs(&mut self, replacements: &HashMap<String, String>) {
        if replacements.is_empty() {
            return;
        }

        for node in self.nodes_mut() {
            let rewritten = map_expressions(&node.inputs, &mut |expr| {
                Ok::<_, Infallible>(split_reference(expr).and_then(|(id, key)| {
                    replacements
                        .get(id)
                        .map(|new_id| Value::String(render_token(&format!("{new_id}.{key}"))))
                }))
            });
            let Ok(inputs) = rewritten;
            node.inputs = inputs;
        }

        let rename = |id: &String| replacements.get(id).cloned().unwrap_or_else(|| id.clone());
        let edges: Vec<GraphEdge> = self
            .edges()
            .map(|edge| GraphEdge::new(rename(&edge.from), rename(&edge.to)))
            .collect();
        self.set_edges(edges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn module(name: &str) -> InfraGraphNode {
        InfraGraphNode::new(NodeKey::new("module", name), "registry/module:latest", PluginKind::Pulumi)
    }

    #[test]
    fn test_node_id_includes_color() {
        let node = module("vpc");
        assert_eq!(node.id(), "module/vpc@blue");
        let node = node.with_color(NodeColor::Green);
        assert_eq!(node.id(), "module/vpc@green");
        assert_eq!(node.key(), &NodeKey::new("module", "vpc"));
    }

    #[test]
    fn test_serde_shape() {
        let node = module("vpc").with_inputs(json!({ "region": "nyc1" }));
        let json = serde_json::to_value(&node).expect("serialize");

        assert_eq!(json["type"], "module");
        assert_eq!(json["name"], "vpc");
        assert_eq!(json["color"], "blue");
        assert_eq!(json["action"], "create");
        assert_eq!(json["status"]["state"], "pending");
        assert_eq!(json["plugin"], "pulumi");

        let back: InfraGraphNode = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, node);
    }

    #[test]
    fn test_no_op_serializes_kebab_case() {
        let json = serde_json::to_value(NodeAction::NoOp).expect("serialize");
        assert_eq!(json, "no-op");
    }

    #[test]
    fn test_queue_respects_dependencies() {
        let mut vpc = module("vpc");
        vpc.status = NodeStatus::complete();
        let cluster = module("cluster");
        let app = module("app");
        let graph = InfraGraph::from_parts(
            [vpc, cluster, app],
            [
                GraphEdge::new("module/cluster@blue", "module/vpc@blue"),
                GraphEdge::new("module/app@blue", "module/cluster@blue"),
            ],
        );

        let queue: Vec<String> = graph.get_queue().iter().map(|n| n.id()).collect();
        assert_eq!(queue, vec!["module/cluster@blue"]);
    }

    #[test]
    fn test_queue_orders_by_environment_and_component() {
        let a = InfraGraphNode::new(
            NodeKey::scoped("module", "a", Some("web"), Some("prod")),
            "img",
            PluginKind::Pulumi,
        );
        let b = InfraGraphNode::new(
            NodeKey::scoped("module", "b", Some("api"), Some("prod")),
            "img",
            PluginKind::Pulumi,
        );
        let c = module("c");
        let graph = InfraGraph::from_parts([a, b, c], []);

        let queue: Vec<&str> = graph.get_queue().iter().map(|n| n.key().name()).collect();
        assert_eq!(queue, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_replace_node_refs_rewrites_tokens_and_edges() {
        let vpc = module("vpc");
        let cluster = module("cluster").with_inputs(json!({
            "vpc": "${{ module/vpc@blue.id }}",
            "tags": ["${{ module/vpc@blue.name }}-cluster"],
        }));
        let mut graph = InfraGraph::from_parts(
            [vpc, cluster],
            [GraphEdge::new("module/cluster@blue", "module/vpc@blue")],
        );

        let replacements =
            HashMap::from([("module/vpc@blue".to_string(), "module/vpc@green".to_string())]);
        graph.replace_node_refs(&replacements);

        let cluster = graph.node("module/cluster@blue").expect("cluster");
        assert_eq!(cluster.inputs["vpc"], "${{ module/vpc@green.id }}");
        assert_eq!(cluster.inputs["tags"][0], "${{ module/vpc@green.name }}-cluster");
        assert!(graph.has_edge("module/cluster@blue", "module/vpc@green"));
        assert_eq!(cluster.referenced_ids(), vec!["module/vpc@green"]);
    }
}
