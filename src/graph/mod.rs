//! Graph data model.
//!
//! - [`Graph`]: generic node/edge container with identity-keyed storage
//! - [`AppGraph`]: desired resources supplied by component compilers
//! - [`InfraGraph`]: provisioning operations planned and executed by the engine

mod app;
mod base;
mod edge;
mod infra;
mod node;

pub use app::{AppGraph, AppGraphNode};
pub use base::Graph;
pub use edge::GraphEdge;
pub use infra::{InfraGraph, InfraGraphNode, NodeAction, NodeColor, NodeState, NodeStatus};
pub use node::{GraphNode, NodeKey};
