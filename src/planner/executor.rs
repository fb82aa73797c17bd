//! Executes a planned infrastructure graph.
//!
//! The ready queue is recomputed after every state change. Up to
//! `concurrency` nodes are applied at once; a node never starts before every
//! node it depends on is complete.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{ExecutionError, PluginError};
use crate::expression::{replace_refs_with_output_values, unescape_literals};
use crate::graph::{GraphNode, InfraGraph, NodeAction, NodeState, NodeStatus};
use crate::plugin::{ApplyRequest, ApplyResponse, ModuleApplier};

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of concurrent applies.
    pub concurrency: usize,
    /// Directory that relative module sources are resolved against.
    pub cwd: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            cwd: None,
        }
    }
}

/// Outcome of one node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    /// Node id.
    pub id: String,
    /// Action that was executed.
    pub action: NodeAction,
    /// Whether the plugin call succeeded.
    pub success: bool,
    /// Plugin error, if any.
    pub error: Option<String>,
    /// Time spent in the plugin.
    pub duration: Duration,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Per-node results in completion order.
    pub results: Vec<NodeResult>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl ExecutionReport {
    /// Number of nodes applied successfully.
    #[must_use]
    pub fn successful(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Number of nodes that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }
}

type TaskOutput = (String, NodeAction, Duration, Result<ApplyResponse, PluginError>);

/// Applies graphs through a [`ModuleApplier`].
pub struct GraphExecutor {
    applier: Arc<dyn ModuleApplier>,
    options: ExecutorOptions,
}

impl std::fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GraphExecutor {
    /// Creates an executor with default options.
    #[must_use]
    pub fn new(applier: Arc<dyn ModuleApplier>) -> Self {
        Self {
            applier,
            options: ExecutorOptions::default(),
        }
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the concurrency bound. Values below 1 are treated as 1.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.options.concurrency = concurrency.max(1);
        self
    }

    fn resolve_image(&self, image: &str) -> String {
        match &self.options.cwd {
            Some(cwd) if image.starts_with("./") || image.starts_with("../") => {
                cwd.join(Path::new(image)).display().to_string()
            }
            _ => image.to_string(),
        }
    }

    /// Applies every incomplete node of `graph`, mutating statuses, outputs
    /// and state in place.
    ///
    /// A snapshot of the graph is sent to `observer` after every change. On
    /// the first failure no further nodes are started; applies already in
    /// flight are awaited and recorded before the error is returned, so the
    /// graph always reflects what the plugins did.
    ///
    /// # Errors
    ///
    /// - [`ExecutionError::UnresolvedReference`] if a node's inputs reference
    ///   outputs that do not exist
    /// - [`ExecutionError::NodeFailed`] if a plugin call fails
    /// - [`ExecutionError::InvariantViolation`] if nodes remain incomplete
    ///   once nothing is runnable
    pub async fn apply(
        &self,
        graph: &mut InfraGraph,
        observer: Option<&UnboundedSender<InfraGraph>>,
    ) -> Result<ExecutionReport, ExecutionError> {
        let started = Instant::now();
        let concurrency = self.options.concurrency.max(1);
        let mut report = ExecutionReport::default();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut failure: Option<ExecutionError> = None;

        info!("Applying graph with {} nodes (concurrency {concurrency})", graph.len());

        loop {
            let mut progressed = false;
            if failure.is_none() {
                match self.dispatch(graph, &mut tasks, &mut in_flight, concurrency) {
                    Ok(dispatched) => progressed = dispatched,
                    Err(e) => failure = Some(e),
                }
                if progressed {
                    emit(graph, observer);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                if progressed {
                    continue;
                }
                break;
            };

            let (id, action, duration, result) =
                joined.map_err(|e| ExecutionError::TaskFailed {
                    message: e.to_string(),
                })?;
            in_flight.remove(&id);

            let Some(node) = graph.node_mut(&id) else {
                return Err(ExecutionError::TaskFailed {
                    message: format!("node {id} disappeared during apply"),
                });
            };

            match result {
                Ok(response) => {
                    info!("{action} {id} complete in {:.1}s", duration.as_secs_f64());
                    node.outputs = Some(response.outputs);
                    node.state = response.state;
                    node.status.transition(NodeState::Complete, None);
                    report.results.push(NodeResult {
                        id,
                        action,
                        success: true,
                        error: None,
                        duration,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    error!("{action} {id} failed: {message}");
                    node.status.transition(NodeState::Error, Some(message.clone()));
                    report.results.push(NodeResult {
                        id: id.clone(),
                        action,
                        success: false,
                        error: Some(message.clone()),
                        duration,
                    });
                    if failure.is_none() {
                        failure = Some(ExecutionError::NodeFailed { node: id, message });
                    }
                }
            }
            emit(graph, observer);
        }

        if let Some(failure) = failure {
            return Err(failure);
        }

        let pending: Vec<String> = graph
            .nodes()
            .filter(|node| !node.is_complete())
            .map(GraphNode::id)
            .collect();
        if !pending.is_empty() {
            return Err(ExecutionError::InvariantViolation { pending });
        }

        report.duration = started.elapsed();
        info!(
            "Applied {} nodes in {:.1}s",
            report.successful(),
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    /// Starts ready nodes until the concurrency bound is reached. Returns
    /// true if any node changed state.
    fn dispatch(
        &self,
        graph: &mut InfraGraph,
        tasks: &mut JoinSet<TaskOutput>,
        in_flight: &mut HashSet<String>,
        concurrency: usize,
    ) -> Result<bool, ExecutionError> {
        let ready: Vec<String> = graph
            .get_queue()
            .into_iter()
            .map(GraphNode::id)
            .filter(|id| !in_flight.contains(id))
            .collect();
        if ready.is_empty() {
            return Ok(false);
        }

        let outputs = graph.completed_outputs();
        let mut progressed = false;

        for id in ready {
            if in_flight.len() >= concurrency {
                break;
            }
            let Some(node) = graph.node_mut(&id) else {
                continue;
            };

            if node.action == NodeAction::NoOp {
                debug!("{id} unchanged");
                node.status = NodeStatus::complete();
                progressed = true;
                continue;
            }

            if node.action != NodeAction::Delete {
                node.inputs = replace_refs_with_output_values(&node.inputs, &outputs).map_err(
                    |source| ExecutionError::UnresolvedReference {
                        node: id.clone(),
                        source,
                    },
                )?;
            }

            let (state, destroy) = match node.action {
                NodeAction::Delete => (NodeState::Destroying, true),
                _ => (NodeState::Applying, false),
            };
            node.status.transition(state, None);

            let request = ApplyRequest {
                plugin_id: id.clone(),
                image: self.resolve_image(&node.image),
                inputs: ApplyRequest::input_pairs(&unescape_literals(&node.inputs)),
                state: node.state.clone(),
                destroy,
            };
            let plugin = node.plugin;
            let action = node.action;
            let applier = Arc::clone(&self.applier);

            info!("{action} {id} via {plugin}");
            let task_id = id.clone();
            tasks.spawn(async move {
                let start = Instant::now();
                let result = applier.apply(plugin, request).await;
                (task_id, action, start.elapsed(), result)
            });
            in_flight.insert(id);
            progressed = true;
        }

        Ok(progressed)
    }
}

fn emit(graph: &InfraGraph, observer: Option<&UnboundedSender<InfraGraph>>) {
    if let Some(observer) = observer {
        // A closed receiver only means nobody is watching.
        let _ = observer.send(graph.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphEdge, InfraGraphNode, NodeKey};
    use crate::plugin::{MockModuleApplier, PluginKind};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn module(name: &str, inputs: Value) -> InfraGraphNode {
        InfraGraphNode::new(NodeKey::new("module", name), format!("acme/{name}"), PluginKind::Pulumi)
            .with_inputs(inputs)
    }

    /// vpc <- cluster <- app
    fn chain() -> InfraGraph {
        InfraGraph::from_parts(
            vec![
                module("app", json!({ "cluster": "${{ module/cluster@blue.name }}" })),
                module("cluster", json!({ "vpc": "${{ module/vpc@blue.id }}" })),
                module("vpc", json!({ "cidr": "10.0.0.0/16" })),
            ],
            vec![
                GraphEdge::new("module/app@blue", "module/cluster@blue"),
                GraphEdge::new("module/cluster@blue", "module/vpc@blue"),
            ],
        )
    }

    fn recording_applier(calls: Arc<Mutex<Vec<ApplyRequest>>>) -> MockModuleApplier {
        let mut applier = MockModuleApplier::new();
        applier.expect_apply().returning(move |_, request| {
            let name = request.plugin_id.clone();
            calls.lock().expect("lock").push(request);
            Ok(ApplyResponse {
                state: Some(json!({ "serial": 1 })),
                outputs: json!({ "id": format!("{name}-id"), "name": format!("{name}-name") }),
            })
        });
        applier
    }

    #[tokio::test]
    async fn test_applies_in_dependency_order_and_resolves_refs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(Arc::clone(&calls))));

        let mut graph = chain();
        let report = assert_ok!(executor.apply(&mut graph, None).await);
        assert_eq!(report.successful(), 3);

        let calls = calls.lock().expect("lock");
        let order: Vec<&str> = calls.iter().map(|c| c.plugin_id.as_str()).collect();
        assert_eq!(order, vec!["module/vpc@blue", "module/cluster@blue", "module/app@blue"]);
        assert_eq!(
            calls[1].inputs,
            vec![("vpc".to_string(), json!("module/vpc@blue-id"))]
        );

        let app = graph.node("module/app@blue").expect("app");
        assert!(app.is_complete());
        assert_eq!(app.inputs["cluster"], "module/cluster@blue-name");
        assert_eq!(app.state, Some(json!({ "serial": 1 })));
    }

    #[tokio::test]
    async fn test_escaped_literals_reach_plugin_unescaped() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(Arc::clone(&calls))));

        let mut graph = InfraGraph::from_parts(
            vec![module("init", json!({ "script": "export PATH=$${HOME}/bin" }))],
            vec![],
        );
        assert_ok!(executor.apply(&mut graph, None).await);

        let calls = calls.lock().expect("lock");
        assert_eq!(
            calls[0].inputs,
            vec![("script".to_string(), json!("export PATH=${HOME}/bin"))]
        );
        let node = graph.node("module/init@blue").expect("init");
        assert_eq!(node.inputs["script"], "export PATH=$${HOME}/bin");
    }

    #[tokio::test]
    async fn test_failure_marks_node_and_stops() {
        let mut applier = MockModuleApplier::new();
        applier.expect_apply().returning(|_, request| {
            if request.plugin_id == "module/cluster@blue" {
                Err(PluginError::Remote {
                    message: "quota exceeded".to_string(),
                })
            } else {
                Ok(ApplyResponse {
                    state: None,
                    outputs: json!({ "id": "vpc-1" }),
                })
            }
        });
        let executor = GraphExecutor::new(Arc::new(applier));

        let mut graph = chain();
        let err = assert_err!(executor.apply(&mut graph, None).await);
        assert!(matches!(err, ExecutionError::NodeFailed { ref node, .. } if node == "module/cluster@blue"));

        let cluster = graph.node("module/cluster@blue").expect("cluster");
        assert_eq!(cluster.status.state, NodeState::Error);
        assert_eq!(cluster.status.message.as_deref(), Some("quota exceeded"));
        assert!(graph.node("module/vpc@blue").expect("vpc").is_complete());
        assert_eq!(graph.node("module/app@blue").expect("app").status.state, NodeState::Pending);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_fatal() {
        let mut applier = MockModuleApplier::new();
        applier.expect_apply().never();
        let executor = GraphExecutor::new(Arc::new(applier));

        let mut graph = InfraGraph::from_parts(
            vec![module("app", json!({ "x": "${{ module/missing@blue.id }}" }))],
            vec![],
        );
        let err = assert_err!(executor.apply(&mut graph, None).await);
        assert!(matches!(err, ExecutionError::UnresolvedReference { .. }));
    }

    #[tokio::test]
    async fn test_deletes_skip_resolution_and_send_destroy() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(Arc::clone(&calls))));

        let mut node = module("old", json!({ "vpc": "${{ module/gone@blue.id }}" }))
            .with_action(NodeAction::Delete);
        node.state = Some(json!("state-blob"));
        let mut graph = InfraGraph::from_parts(vec![node], vec![]);

        assert_ok!(executor.apply(&mut graph, None).await);
        let calls = calls.lock().expect("lock");
        assert!(calls[0].destroy);
        assert_eq!(calls[0].state, Some(json!("state-blob")));
    }

    #[tokio::test]
    async fn test_no_op_nodes_are_not_applied() {
        let mut applier = MockModuleApplier::new();
        applier.expect_apply().never();
        let executor = GraphExecutor::new(Arc::new(applier));

        let mut graph = InfraGraph::from_parts(
            vec![module("vpc", json!({})).with_action(NodeAction::NoOp)],
            vec![],
        );
        let report = assert_ok!(executor.apply(&mut graph, None).await);
        assert!(report.results.is_empty());
        assert!(graph.node("module/vpc@blue").expect("vpc").is_complete());
    }

    #[tokio::test]
    async fn test_concurrent_applies_respect_dependencies() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(Arc::clone(&calls))))
            .with_concurrency(4);

        let mut graph = chain();
        graph.insert_node(module("dns", json!({})));
        graph.insert_node(module("bucket", json!({})));

        let report = assert_ok!(executor.apply(&mut graph, None).await);
        assert_eq!(report.successful(), 5);

        let calls = calls.lock().expect("lock");
        let position = |id: &str| calls.iter().position(|c| c.plugin_id == id).expect("called");
        assert!(position("module/vpc@blue") < position("module/cluster@blue"));
        assert!(position("module/cluster@blue") < position("module/app@blue"));
    }

    #[tokio::test]
    async fn test_emits_snapshots() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(calls)));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut graph = chain();
        assert_ok!(executor.apply(&mut graph, Some(&tx)).await);
        drop(tx);

        let mut snapshots = Vec::new();
        while let Some(snapshot) = rx.recv().await {
            snapshots.push(snapshot);
        }
        assert!(snapshots.len() >= 3);
        let last = snapshots.last().expect("final snapshot");
        assert!(last.nodes().all(InfraGraphNode::is_complete));
    }

    #[tokio::test]
    async fn test_relative_images_resolve_against_cwd() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let executor = GraphExecutor::new(Arc::new(recording_applier(Arc::clone(&calls))))
            .with_options(ExecutorOptions {
                concurrency: 1,
                cwd: Some(PathBuf::from("/work")),
            });

        let node = InfraGraphNode::new(NodeKey::new("module", "local"), "./modules/vpc", PluginKind::Opentofu);
        let mut graph = InfraGraph::from_parts(vec![node], vec![]);
        assert_ok!(executor.apply(&mut graph, None).await);
        assert_eq!(calls.lock().expect("lock")[0].image, "/work/./modules/vpc");
    }
}
