//! Compile-time scopes available to component resources.
//!
//! Component compilers emit app nodes whose inputs refer to sibling
//! resources symbolically (`services.api.url`, `databases.main.password`).
//! [`ComponentScope::resolve_refs`] turns each such token into a reference to
//! the concrete node id and records the matching edge.

use serde_json::{Value, json};
use std::collections::HashMap;

use super::template::{map_expressions, render_token};
use crate::error::CompileError;
use crate::graph::{AppGraph, AppGraphNode, GraphEdge, GraphNode, NodeKey};

/// Naming context of the component being compiled.
#[derive(Debug, Clone, Default)]
pub struct ComponentScope {
    component: String,
    environment: Option<String>,
    dependencies: HashMap<String, String>,
}

impl ComponentScope {
    /// Creates a scope for `component`.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    /// Sets the environment being compiled for.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Declares a dependency alias and the component it points to.
    #[must_use]
    pub fn with_dependency(mut self, alias: impl Into<String>, component: impl Into<String>) -> Self {
        self.dependencies.insert(alias.into(), component.into());
        self
    }

    fn node_id(&self, resource_type: &str, name: &str, component: &str) -> String {
        NodeKey::scoped(resource_type, name, Some(component), self.environment.as_deref())
            .to_string()
    }

    fn dependency(&self, alias: &str) -> Result<&str, CompileError> {
        self.dependencies
            .get(alias)
            .map(String::as_str)
            .ok_or_else(|| CompileError::InvalidDependencyReference {
                dependency: alias.to_string(),
            })
    }

    /// Resolves every recognised scope in `inputs` owned by node `from_id`.
    ///
    /// Edges from `from_id` to each referenced node are inserted into
    /// `graph`; `databases.*` references also insert a `databaseUser` node.
    /// Unrecognised tokens are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::InvalidDependencyReference`] for undeclared
    /// dependency aliases.
    pub fn resolve_refs(
        &self,
        graph: &mut AppGraph,
        from_id: &str,
        inputs: &Value,
    ) -> Result<Value, CompileError> {
        map_expressions(inputs, &mut |expr| {
            let parts: Vec<&str> = expr.split('.').collect();
            if parts.iter().any(|part| part.is_empty() || part.contains(char::is_whitespace)) {
                return Ok(None);
            }

            let (target, key) = match parts.as_slice() {
                ["environment", "name"] => {
                    return Ok(self.environment.clone().map(Value::String));
                }
                [
                    "variables" | "secrets" | "parameters" | "vars",
                    name,
                ] => (self.node_id("secret", name, &self.component), "data".to_string()),
                ["databases", database, key] => {
                    (self.database_user(graph, from_id, database), (*key).to_string())
                }
                ["builds", name, key] => {
                    (self.node_id("dockerBuild", name, &self.component), (*key).to_string())
                }
                ["services", name, key] => {
                    (self.node_id("service", name, &self.component), (*key).to_string())
                }
                ["ingresses", name, key] => {
                    (self.node_id("ingressRule", name, &self.component), (*key).to_string())
                }
                ["dependencies", alias, "outputs", output] => {
                    let component = self.dependency(alias)?;
                    (self.node_id("secret", output, component), "data".to_string())
                }
                ["dependencies", alias, "services", name, key] => {
                    let component = self.dependency(alias)?;
                    (self.node_id("service", name, component), (*key).to_string())
                }
                ["dependencies", alias, "ingresses", name, key] => {
                    let component = self.dependency(alias)?;
                    (self.node_id("ingressRule", name, component), (*key).to_string())
                }
                _ => return Ok(None),
            };

            graph.insert_edge(GraphEdge::new(from_id, target.clone()));
            Ok(Some(Value::String(render_token(&format!("{target}.{key}")))))
        })
    }

    /// Inserts the per-reference database user node and returns its id.
    fn database_user(&self, graph: &mut AppGraph, from_id: &str, database: &str) -> String {
        let database_id = self.node_id("database", database, &self.component);
        let name = format!("{from_id}/{database}");
        let field = |key: &str| render_token(&format!("{database_id}.{key}"));

        let mut user = AppGraphNode::new("databaseUser", name.clone())
            .with_component(self.component.clone())
            .with_inputs(json!({
                "name": name.replace('/', "--"),
                "protocol": field("protocol"),
                "host": field("host"),
                "port": field("port"),
                "username": field("username"),
                "password": field("password"),
                "database": field("database"),
            }));
        user.environment.clone_from(&self.environment);

        let user_id = user.id();
        graph.insert_node(user);
        graph.insert_edge(GraphEdge::new(user_id.clone(), database_id));
        graph.insert_edge(GraphEdge::new(from_id, user_id.clone()));
        user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_deployment() -> (AppGraph, String) {
        let deployment = AppGraphNode::new("deployment", "api").with_component("shop");
        let id = deployment.id();
        let mut graph = AppGraph::new();
        graph.insert_node(deployment);
        graph.insert_node(AppGraphNode::new("database", "main").with_component("shop"));
        (graph, id)
    }

    #[test]
    fn test_secret_and_service_refs() {
        let (mut graph, from) = graph_with_deployment();
        let scope = ComponentScope::new("shop");

        let resolved = scope
            .resolve_refs(
                &mut graph,
                &from,
                &json!({
                    "key": "${{ secrets.api_key }}",
                    "upstream": "${{ services.web.url }}",
                    "ingress": "${{ ingresses.public.host }}"
                }),
            )
            .expect("resolves");

        assert_eq!(resolved["key"], "${{ shop/secret/api_key.data }}");
        assert_eq!(resolved["upstream"], "${{ shop/service/web.url }}");
        assert_eq!(resolved["ingress"], "${{ shop/ingressRule/public.host }}");
        assert!(graph.has_edge(&from, "shop/secret/api_key"));
        assert!(graph.has_edge(&from, "shop/service/web"));
    }

    #[test]
    fn test_database_ref_synthesizes_user_node() {
        let (mut graph, from) = graph_with_deployment();
        let scope = ComponentScope::new("shop");

        let resolved = scope
            .resolve_refs(&mut graph, &from, &json!({ "DB_URL": "${{ databases.main.url }}" }))
            .expect("resolves");

        let user_id = "shop/databaseUser/shop/deployment/api/main";
        assert_eq!(resolved["DB_URL"], format!("${{{{ {user_id}.url }}}}"));

        let user = graph.node(user_id).expect("user node");
        assert_eq!(user.inputs["name"], "shop--deployment--api--main");
        assert_eq!(user.inputs["host"], "${{ shop/database/main.host }}");
        assert!(graph.has_edge(user_id, "shop/database/main"));
        assert!(graph.has_edge(&from, user_id));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_dependency_refs() {
        let (mut graph, from) = graph_with_deployment();
        let scope = ComponentScope::new("shop").with_dependency("auth", "acme/auth");

        let resolved = scope
            .resolve_refs(
                &mut graph,
                &from,
                &json!([
                    "${{ dependencies.auth.outputs.issuer }}",
                    "${{ dependencies.auth.services.api.url }}"
                ]),
            )
            .expect("resolves");

        assert_eq!(resolved[0], "${{ acme/auth/secret/issuer.data }}");
        assert_eq!(resolved[1], "${{ acme/auth/service/api.url }}");

        let err = scope
            .resolve_refs(&mut graph, &from, &json!("${{ dependencies.billing.outputs.x }}"))
            .expect_err("unknown dependency");
        assert!(matches!(err, CompileError::InvalidDependencyReference { .. }));
    }

    #[test]
    fn test_environment_name_and_unknown_scopes() {
        let (mut graph, from) = graph_with_deployment();
        let scope = ComponentScope::new("shop").with_environment("staging");

        let resolved = scope
            .resolve_refs(
                &mut graph,
                &from,
                &json!({ "env": "${{ environment.name }}", "other": "${{ foo.bar }}" }),
            )
            .expect("resolves");

        assert_eq!(resolved["env"], "staging");
        assert_eq!(resolved["other"], "${{ foo.bar }}");
    }
}
