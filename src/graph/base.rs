//! Generic graph container shared by the app and infrastructure graphs.

use indexmap::{IndexMap, IndexSet};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::collections::{HashMap, VecDeque};

use super::{GraphEdge, GraphNode};
use crate::error::GraphError;

/// A directed graph of nodes keyed by their identity.
///
/// Nodes keep insertion order. Inserting a node whose id already exists
/// replaces it in place.
#[derive(Debug, Clone)]
pub struct Graph<N> {
    nodes: IndexMap<String, N>,
    edges: IndexSet<GraphEdge>,
}

impl<N> Default for Graph<N> {
    fn default() -> Self {
        Self {
            nodes: IndexMap::new(),
            edges: IndexSet::new(),
        }
    }
}

impl<N: GraphNode> Graph<N> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph from nodes and edges.
    #[must_use]
    pub fn from_parts(
        nodes: impl IntoIterator<Item = N>,
        edges: impl IntoIterator<Item = GraphEdge>,
    ) -> Self {
        let mut graph = Self::new();
        graph.insert_nodes(nodes);
        graph.insert_edges(edges);
        graph
    }

    /// Inserts a node, replacing any node with the same id.
    pub fn insert_node(&mut self, node: N) {
        self.nodes.insert(node.id(), node);
    }

    /// Inserts several nodes.
    pub fn insert_nodes(&mut self, nodes: impl IntoIterator<Item = N>) {
        for node in nodes {
            self.insert_node(node);
        }
    }

    /// Inserts an edge. Self-loops and duplicates are ignored.
    ///
    /// Returns true if the edge was added.
    pub fn insert_edge(&mut self, edge: GraphEdge) -> bool {
        if edge.is_self_loop() {
            return false;
        }
        self.edges.insert(edge)
    }

    /// Inserts several edges.
    pub fn insert_edges(&mut self, edges: impl IntoIterator<Item = GraphEdge>) {
        for edge in edges {
            self.insert_edge(edge);
        }
    }

    /// Merges another graph into this one.
    pub fn merge(&mut self, other: Self) {
        self.nodes.extend(other.nodes);
        self.insert_edges(other.edges);
    }

    /// Removes a node and every edge touching it.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist.
    pub fn remove_node(&mut self, id: &str) -> Result<N, GraphError> {
        let node = self
            .nodes
            .shift_remove(id)
            .ok_or_else(|| GraphError::NodeNotFound { id: id.to_string() })?;
        self.edges.retain(|edge| edge.from != id && edge.to != id);
        Ok(node)
    }

    /// Removes edges matching the given endpoints. `None` matches any endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if no edge matched.
    pub fn remove_edges(&mut self, from: Option<&str>, to: Option<&str>) -> Result<usize, GraphError> {
        let before = self.edges.len();
        self.edges.retain(|edge| {
            let from_matches = from.is_none_or(|f| edge.from == f);
            let to_matches = to.is_none_or(|t| edge.to == t);
            !(from_matches && to_matches)
        });
        let removed = before - self.edges.len();
        if removed == 0 {
            return Err(GraphError::EdgeNotFound {
                from: from.unwrap_or("*").to_string(),
                to: to.unwrap_or("*").to_string(),
            });
        }
        Ok(removed)
    }

    /// Keeps only the edges for which the predicate returns true.
    pub fn retain_edges(&mut self, mut keep: impl FnMut(&GraphEdge) -> bool) {
        self.edges.retain(|edge| keep(edge));
    }

    /// Replaces the edge set.
    pub fn set_edges(&mut self, edges: impl IntoIterator<Item = GraphEdge>) {
        self.edges.clear();
        self.insert_edges(edges);
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&N> {
        self.nodes.get(id)
    }

    /// Looks up a node by id for mutation.
    pub fn node_mut(&mut self, id: &str) -> Option<&mut N> {
        self.nodes.get_mut(id)
    }

    /// Returns true if a node with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.values()
    }

    /// Iterates nodes mutably in insertion order.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.nodes.values_mut()
    }

    /// Iterates node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Iterates edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the exact edge exists.
    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&GraphEdge::new(from, to))
    }

    /// Nodes that `id` depends on.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&N> {
        self.edges
            .iter()
            .filter(|edge| edge.from == id)
            .filter_map(|edge| self.nodes.get(&edge.to))
            .collect()
    }

    /// Nodes that depend on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&N> {
        self.edges
            .iter()
            .filter(|edge| edge.to == id)
            .filter_map(|edge| self.nodes.get(&edge.from))
            .collect()
    }

    /// Checks that every edge endpoint exists and the graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns the first dangling edge found, or the nodes caught in a cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(GraphError::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Orders node ids so that every node comes after its dependencies.
    ///
    /// Edges with a missing endpoint are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] listing the nodes that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut pending: HashMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) || !self.nodes.contains_key(&edge.to) {
                continue;
            }
            if let Some(count) = pending.get_mut(edge.from.as_str()) {
                *count += 1;
            }
            dependents
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.as_str());
        }

        let mut ready: VecDeque<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| pending.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for &dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let nodes = self
                .nodes
                .keys()
                .filter(|id| pending.get(id.as_str()).is_some_and(|count| *count > 0))
                .cloned()
                .collect();
            Err(GraphError::Cycle { nodes })
        }
    }
}

impl<N: Serialize> Serialize for Graph<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nodes: Vec<&N> = self.nodes.values().collect();
        let mut state = serializer.serialize_struct("Graph", 2)?;
        state.serialize_field("nodes", &nodes)?;
        state.serialize_field("edges", &self.edges)?;
        state.end()
    }
}

impl<'de, N: Deserialize<'de> + GraphNode> Deserialize<'de> for Graph<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Repr<T> {
            #[serde(default = "Vec::new")]
            nodes: Vec<T>,
            #[serde(default)]
            edges: Vec<GraphEdge>,
        }

        let repr = Repr::<N>::deserialize(deserializer)?;
        Ok(Self::from_parts(repr.nodes, repr.edges))
    }
}
