//! Compiles a datacenter and an app graph into an infrastructure graph.

use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::outputs::missing_outputs;
use super::spec::{
    DatacenterSpec, DatacenterV1, EnvironmentSpec, GetGraphOptions, ModuleSpec, ResourceHook,
};
use crate::error::CompileError;
use crate::expression::{
    Context, Expression, Template, lookup_path, map_expressions, parse_path, render_token,
    split_reference, visit_expressions,
};
use crate::graph::{AppGraph, AppGraphNode, GraphEdge, GraphNode, InfraGraph, InfraGraphNode, NodeKey};
use crate::variables::{
    DatacenterVariablesSchema, VARIABLE_SCOPES, resolve_variables, variables_schema,
};

/// Turns a datacenter definition into an infrastructure graph.
pub trait DatacenterCompiler {
    /// Builds the graph of modules for `app_graph`.
    ///
    /// # Errors
    ///
    /// Returns the first construction error; no partial graph is produced.
    fn get_graph(
        &self,
        app_graph: &AppGraph,
        options: &GetGraphOptions,
    ) -> Result<InfraGraph, CompileError>;

    /// Declared variables with their dependencies.
    ///
    /// # Errors
    ///
    /// Fails when a variable references an undeclared one.
    fn get_variables_schema(&self) -> Result<DatacenterVariablesSchema, CompileError>;
}

impl DatacenterCompiler for DatacenterSpec {
    fn get_graph(
        &self,
        app_graph: &AppGraph,
        options: &GetGraphOptions,
    ) -> Result<InfraGraph, CompileError> {
        match self {
            Self::V1(datacenter) => datacenter.get_graph(app_graph, options),
        }
    }

    fn get_variables_schema(&self) -> Result<DatacenterVariablesSchema, CompileError> {
        match self {
            Self::V1(datacenter) => datacenter.get_variables_schema(),
        }
    }
}

impl DatacenterCompiler for DatacenterV1 {
    fn get_graph(
        &self,
        app_graph: &AppGraph,
        options: &GetGraphOptions,
    ) -> Result<InfraGraph, CompileError> {
        let schema = self.get_variables_schema()?;
        let variables = resolve_variables(&schema, &options.variables)?;
        let variables = Value::Object(variables.into_iter().collect());

        let mut context =
            Context::new().with_scope("datacenter", json!({ "name": options.datacenter_name }));
        for scope in VARIABLE_SCOPES {
            context = context.with_strict_scope(scope, variables.clone());
        }

        // Compile a copy so the caller's definition is never touched.
        let module = apply_to_modules(&context, &self.module)?;
        let environment = self
            .environment
            .iter()
            .map(|env| apply_to_environment(&context, env))
            .collect::<Result<Vec<_>, _>>()?;

        let mut graph = InfraGraph::new();
        let root_scope = ModuleScope::default();
        let root = root_scope.build(&module, &HashMap::new())?;
        graph.merge(root.graph);

        if let Some(environment_name) = &options.environment_name {
            let context = Context::new().with_scope("environment", json!({ "name": environment_name }));
            let environment = merge_environments(&environment)?;
            let environment = apply_to_environment(&context, &environment)?;

            let env_scope = ModuleScope {
                environment: Some(environment_name.clone()),
                ..ModuleScope::default()
            };
            let env = env_scope.build(&environment.module, &root.ids)?;
            graph.merge(env.graph);

            let mut visible = root.ids;
            visible.extend(env.ids);

            let hooks = HookCompiler {
                environment_name,
                hooks: &environment.hooks,
                visible: &visible,
            };
            hooks.check_when_clauses()?;
            hooks.apply(app_graph, &mut graph)?;
        }

        check_expressions(&graph)?;
        graph.validate()?;

        info!(
            "Compiled datacenter {} into {} modules",
            options.datacenter_name,
            graph.len()
        );
        Ok(graph)
    }

    fn get_variables_schema(&self) -> Result<DatacenterVariablesSchema, CompileError> {
        variables_schema(&self.variable)
    }
}

fn apply_to_modules(
    context: &Context,
    modules: &IndexMap<String, ModuleSpec>,
) -> Result<IndexMap<String, ModuleSpec>, CompileError> {
    modules
        .iter()
        .map(|(name, module)| {
            let inputs = context.apply(&module.inputs)?;
            Ok::<_, CompileError>((name.clone(), ModuleSpec { inputs, ..module.clone() }))
        })
        .collect()
}

fn apply_to_environment(
    context: &Context,
    environment: &EnvironmentSpec,
) -> Result<EnvironmentSpec, CompileError> {
    let mut hooks = IndexMap::with_capacity(environment.hooks.len());
    for (resource_type, resource_hooks) in &environment.hooks {
        let mut applied = Vec::with_capacity(resource_hooks.len());
        for hook in resource_hooks {
            let mut hook = hook.clone();
            hook.when = hook.when.map(|when| context.apply(&when)).transpose()?;
            hook.module = apply_to_modules(context, &hook.module)?;
            hook.outputs = context.apply(&hook.outputs)?;
            applied.push(hook);
        }
        hooks.insert(resource_type.clone(), applied);
    }

    Ok(EnvironmentSpec {
        module: apply_to_modules(context, &environment.module)?,
        hooks,
    })
}

/// Folds repeated `environment` blocks into one.
fn merge_environments(blocks: &[EnvironmentSpec]) -> Result<EnvironmentSpec, CompileError> {
    let mut merged = EnvironmentSpec::default();
    for block in blocks {
        for (name, module) in &block.module {
            if merged.module.insert(name.clone(), module.clone()).is_some() {
                return Err(CompileError::DuplicateModule { name: name.clone() });
            }
        }
        for (resource_type, hooks) in &block.hooks {
            merged
                .hooks
                .entry(resource_type.clone())
                .or_default()
                .extend(hooks.iter().cloned());
        }
    }
    Ok(merged)
}

/// Naming context for one set of modules.
#[derive(Debug, Default)]
struct ModuleScope {
    prefix: Option<String>,
    component: Option<String>,
    environment: Option<String>,
    app_node_id: Option<String>,
}

/// Modules of one scope, and their ids by module name.
struct ScopedGraph {
    graph: InfraGraph,
    ids: HashMap<String, String>,
}

impl ModuleScope {
    fn key(&self, name: &str) -> NodeKey {
        let name = match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        };
        NodeKey::scoped(
            "module",
            name,
            self.component.as_deref(),
            self.environment.as_deref(),
        )
    }

    /// Creates one node per module and resolves `module.<name>.<key>`
    /// references against this scope, then against `parents`.
    fn build(
        &self,
        modules: &IndexMap<String, ModuleSpec>,
        parents: &HashMap<String, String>,
    ) -> Result<ScopedGraph, CompileError> {
        let ids: HashMap<String, String> = modules
            .iter()
            .map(|(name, module)| {
                let node = InfraGraphNode::new(self.key(name), &module.source, module.plugin);
                (name.clone(), node.id())
            })
            .collect();

        let mut graph = InfraGraph::new();
        for (name, module) in modules {
            let mut node = InfraGraphNode::new(self.key(name), &module.source, module.plugin);
            if let Some(app_node_id) = &self.app_node_id {
                node = node.with_app_node(app_node_id);
            }
            let node_id = node.id();

            let mut edges = Vec::new();
            let inputs = resolve_module_refs(&module.inputs, |reference| {
                if reference == name.as_str() {
                    return None;
                }
                let target = ids.get(reference).or_else(|| parents.get(reference))?;
                edges.push(GraphEdge::new(node_id.clone(), target.clone()));
                Some(target.clone())
            })
            .map_err(|reference| CompileError::InvalidModuleReference {
                module: name.clone(),
                reference,
            })?;

            graph.insert_node(node.with_inputs(inputs));
            graph.insert_edges(edges);
        }

        debug!("Built {} modules in scope {:?}", graph.len(), self.prefix);
        Ok(ScopedGraph { graph, ids })
    }
}

/// Rewrites `module.<name>.<key>` tokens to `<node id>.<key>`.
///
/// `lookup` maps a module name to its node id. An unresolvable reference
/// fails with the reference text.
fn resolve_module_refs(
    value: &Value,
    mut lookup: impl FnMut(&str) -> Option<String>,
) -> Result<Value, String> {
    map_expressions(value, &mut |expr| {
        let Some(rest) = expr.strip_prefix("module.") else {
            return Ok(None);
        };
        let (name, key) = rest.split_once('.').ok_or_else(|| expr.to_string())?;
        let target = lookup(name).ok_or_else(|| expr.to_string())?;
        Ok(Some(Value::String(render_token(&format!("{target}.{key}")))))
    })
}

/// Instantiates resource hooks for the nodes of an app graph.
struct HookCompiler<'a> {
    environment_name: &'a str,
    hooks: &'a IndexMap<String, Vec<ResourceHook>>,
    visible: &'a HashMap<String, String>,
}

impl HookCompiler<'_> {
    /// Rejects `when` clauses that look at module outputs.
    fn check_when_clauses(&self) -> Result<(), CompileError> {
        for (resource_type, hooks) in self.hooks {
            for when in hooks.iter().filter_map(|hook| hook.when.as_ref()) {
                let Value::String(clause) = when else {
                    continue;
                };
                let expression = parse_when(clause)?;
                if expression.references_scope("module") {
                    return Err(CompileError::ModuleReferencesNotAllowedInWhenClause {
                        resource_type: resource_type.clone(),
                        clause: clause.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply(&self, app_graph: &AppGraph, graph: &mut InfraGraph) -> Result<(), CompileError> {
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut instances = Vec::new();

        for app_node in app_graph.nodes() {
            let Some(hooks) = self.hooks.get(&app_node.resource_type) else {
                continue;
            };
            let context = json!({
                "node": app_node.context(),
                "environment": { "name": self.environment_name },
            });

            for hook in hooks {
                if let Some(when) = &hook.when {
                    if !evaluate_when(when, &context)? {
                        continue;
                    }
                }

                let (instance, hook_outputs) = self.instantiate(app_node, hook)?;
                instances.push(instance);
                outputs.insert(app_node.id(), hook_outputs);
                break;
            }
        }

        for edge in app_graph.edges() {
            if !outputs.contains_key(&edge.to) {
                return Err(CompileError::MissingResourceHook {
                    node: edge.to.clone(),
                    from: edge.from.clone(),
                });
            }
        }

        // Hook instances are merged only now so no instance can see another.
        for instance in instances {
            graph.merge(instance);
        }

        link_app_references(graph, &outputs);
        Ok(())
    }

    fn instantiate(
        &self,
        app_node: &AppGraphNode,
        hook: &ResourceHook,
    ) -> Result<(InfraGraph, Value), CompileError> {
        let app_node_id = app_node.id();
        let context = Context::new().with_scope("node", app_node.context());
        let modules = apply_to_modules(&context, &hook.module)?;

        let scope = ModuleScope {
            prefix: Some(format!("{}/{}", app_node.resource_type, app_node.name)),
            component: app_node.component.clone(),
            environment: app_node
                .environment
                .clone()
                .or_else(|| Some(self.environment_name.to_string())),
            app_node_id: Some(app_node_id.clone()),
        };
        let scoped = scope.build(&modules, self.visible)?;

        let outputs = context.apply(&hook.outputs)?;
        let outputs = resolve_module_refs(&outputs, |reference| {
            scoped
                .ids
                .get(reference)
                .or_else(|| self.visible.get(reference))
                .cloned()
        })
        .map_err(|reference| CompileError::InvalidModuleReference {
            module: format!("{}.outputs", app_node.resource_type),
            reference,
        })?;

        let missing = missing_outputs(&app_node.resource_type, &outputs);
        if !missing.is_empty() {
            return Err(CompileError::InvalidOutputProperties {
                resource_type: app_node.resource_type.clone(),
                node: app_node_id,
                missing,
            });
        }

        debug!("Hook {} matched {app_node_id}", app_node.resource_type);
        Ok((scoped.graph, outputs))
    }
}

/// Extracts the expression of a `when` clause written bare or as a token.
fn parse_when(clause: &str) -> Result<Expression, CompileError> {
    let template = Template::parse(clause);
    let source = template.single_expression().unwrap_or(clause);
    Expression::parse(source).map_err(|e| CompileError::InvalidWhenClause {
        clause: clause.to_string(),
        message: e.to_string(),
    })
}

fn evaluate_when(when: &Value, context: &Value) -> Result<bool, CompileError> {
    let invalid = |message: String| CompileError::InvalidWhenClause {
        clause: when.to_string(),
        message,
    };

    let result = match when {
        Value::Bool(value) => return Ok(*value),
        Value::String(clause) => parse_when(clause)?
            .evaluate(context)
            .map_err(|e| invalid(e.to_string()))?,
        other => return Err(invalid(format!("expected a boolean expression, got {other}"))),
    };

    result
        .as_bool()
        .ok_or_else(|| invalid(format!("evaluated to {result}, not a boolean")))
}

/// Replaces `<app node id>.<key>` tokens in hook module inputs with the
/// outputs the matched hook produced for that app node.
///
/// Outputs may themselves point at other app nodes, so substitution repeats
/// until nothing changes.
fn link_app_references(graph: &mut InfraGraph, outputs: &HashMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }

    let node_ids: HashSet<String> = graph.node_ids().map(str::to_string).collect();
    let mut edges = Vec::new();

    for node in graph.nodes_mut().filter(|node| node.app_node_id.is_some()) {
        let node_id = node.id();
        for _ in 0..=outputs.len() {
            let mut replaced = false;
            let rewritten = map_expressions(&node.inputs, &mut |expr| {
                let found = split_reference(expr).and_then(|(id, key)| {
                    let hook_outputs = outputs.get(id)?;
                    hook_outputs
                        .get(key)
                        .or_else(|| parse_path(key).and_then(|path| lookup_path(hook_outputs, &path)))
                        .cloned()
                });
                replaced |= found.is_some();
                Ok::<_, CompileError>(found)
            });
            match rewritten {
                Ok(inputs) if replaced => node.inputs = inputs,
                _ => break,
            }
        }

        visit_expressions(&node.inputs, &mut |expr| {
            if let Some((id, _)) = split_reference(expr) {
                if node_ids.contains(id) {
                    edges.push(GraphEdge::new(node_id.clone(), id));
                }
            }
        });
    }

    graph.insert_edges(edges);
}

/// Every token left must reference a node the owner has an edge to.
fn check_expressions(graph: &InfraGraph) -> Result<(), CompileError> {
    for node in graph.nodes() {
        let node_id = node.id();
        let mut unresolved = None;
        visit_expressions(&node.inputs, &mut |expr| {
            let linked = split_reference(expr)
                .is_some_and(|(id, _)| graph.contains(id) && graph.has_edge(&node_id, id));
            if !linked && unresolved.is_none() {
                unresolved = Some(expr.to_string());
            }
        });
        if let Some(expression) = unresolved {
            return Err(CompileError::UnresolvedExpression {
                node: node_id,
                expression,
            });
        }
    }
    Ok(())
}
