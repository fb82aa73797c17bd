//! The application graph supplied by component compilers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Graph, GraphNode, NodeKey};

/// A resource an application needs, as produced by a component compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppGraphNode {
    /// Name, unique per type within the component.
    pub name: String,
    /// Resource type tag (`database`, `service`, ...).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Owning component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Target environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Resource inputs, possibly containing `${{ id.key }}` references.
    #[serde(default)]
    pub inputs: Value,
}

impl AppGraphNode {
    /// Creates a node with empty inputs.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            component: None,
            environment: None,
            inputs: Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets the owning component.
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Sets the target environment.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Sets the inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Logical identity of this node.
    #[must_use]
    pub fn key(&self) -> NodeKey {
        NodeKey::scoped(
            &self.resource_type,
            &self.name,
            self.component.as_deref(),
            self.environment.as_deref(),
        )
    }

    /// The `node` object exposed to hook expressions.
    #[must_use]
    pub fn context(&self) -> Value {
        json!({
            "id": self.id(),
            "name": self.name,
            "type": self.resource_type,
            "component": self.component,
            "environment": self.environment,
            "inputs": self.inputs,
        })
    }
}

impl GraphNode for AppGraphNode {
    fn id(&self) -> String {
        self.key().to_string()
    }
}

/// Desired application graph.
pub type AppGraph = Graph<AppGraphNode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_node_id_and_context() {
        let node = AppGraphNode::new("database", "main")
            .with_component("shop")
            .with_inputs(json!({ "databaseType": "postgres" }));

        assert_eq!(node.id(), "shop/database/main");
        let context = node.context();
        assert_eq!(context["type"], "database");
        assert_eq!(context["inputs"]["databaseType"], "postgres");
        assert_eq!(context["environment"], Value::Null);
    }

    #[test]
    fn test_app_graph_accepts_external_shape() {
        let graph: AppGraph = serde_json::from_value(json!({
            "nodes": [
                { "id": "shop/service/api", "name": "api", "type": "service", "component": "shop" },
                { "id": "shop/deployment/api", "name": "api", "type": "deployment", "component": "shop" }
            ],
            "edges": [{ "from": "shop/deployment/api", "to": "shop/service/api" }]
        }))
        .expect("valid app graph");

        assert_eq!(graph.len(), 2);
        assert!(graph.validate().is_ok());
    }
}
