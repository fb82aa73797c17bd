//! Plan and apply runs against persisted state.
//!
//! The reconciler ties the pieces together: it loads the graph stored by the
//! previous run, plans the compiled target graph against it, applies the plan
//! under a state lock, and persists whatever the executor left in the graph,
//! whether the run succeeded or not.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::datacenter::{DatacenterCompiler, DatacenterSpec, GetGraphOptions};
use crate::error::{InfraError, Result};
use crate::graph::{AppGraph, GraphNode, InfraGraph, NodeAction};
use crate::planner::{ExecutionReport, GraphExecutor, GraphPlanner, PlanSummary};
use crate::state::{ApplyHistoryEntry, ApplyOperation, StateKey, StateRecord, StateStore};

/// A planned graph and its summary.
#[derive(Debug, Clone)]
pub struct Plan {
    /// State key the plan was made for.
    pub key: StateKey,
    /// Graph with an action on every node.
    pub graph: InfraGraph,
    /// Action counts.
    pub summary: PlanSummary,
}

impl Plan {
    fn new(key: StateKey, graph: InfraGraph) -> Self {
        let summary = PlanSummary::from_graph(&graph);
        Self {
            key,
            graph,
            summary,
        }
    }

    /// Ids of nodes the plan will apply.
    #[must_use]
    pub fn changed_nodes(&self) -> Vec<String> {
        self.graph
            .nodes()
            .filter(|node| node.action != NodeAction::NoOp)
            .map(GraphNode::id)
            .collect()
    }
}

/// Result of an apply or destroy run.
#[derive(Debug, serde::Serialize)]
pub struct ReconciliationResult {
    /// Whether every node was applied.
    pub success: bool,
    /// Planned action counts.
    pub summary: PlanSummary,
    /// Nodes applied successfully.
    pub applied: usize,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Graph as persisted after the run.
    #[serde(skip)]
    pub graph: InfraGraph,
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Apply {status}:")?;
        writeln!(f, "  Created: {}", self.summary.creates)?;
        writeln!(f, "  Updated: {}", self.summary.updates)?;
        writeln!(f, "  Deleted: {}", self.summary.deletes)?;
        writeln!(f, "  Unchanged: {}", self.summary.no_ops)?;
        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }
        Ok(())
    }
}

/// Compiles a datacenter for an app graph.
///
/// # Errors
///
/// Returns the compiler error if the definition does not compile.
pub fn compile(
    datacenter: &DatacenterSpec,
    app: &AppGraph,
    options: &GetGraphOptions,
) -> Result<InfraGraph> {
    Ok(datacenter.get_graph(app, options)?)
}

/// Plans and applies graphs against a state store.
pub struct Reconciler<'a, S: StateStore> {
    store: &'a S,
    executor: GraphExecutor,
    planner: GraphPlanner,
    progress: Option<UnboundedSender<InfraGraph>>,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a reconciler.
    #[must_use]
    pub const fn new(store: &'a S, executor: GraphExecutor) -> Self {
        Self {
            store,
            executor,
            planner: GraphPlanner::new(),
            progress: None,
        }
    }

    /// Streams graph snapshots while applying.
    #[must_use]
    pub fn with_progress(mut self, sender: UnboundedSender<InfraGraph>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Loads the stored record, or an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn load(&self, key: &StateKey) -> Result<StateRecord> {
        Ok(self
            .store
            .load(key)
            .await?
            .unwrap_or_else(|| StateRecord::new(key.clone())))
    }

    /// Plans `target` against the stored graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn plan(&self, key: &StateKey, target: &InfraGraph) -> Result<Plan> {
        let record = self.load(key).await?;
        let graph = self.planner.plan(&record.graph, target);
        let plan = Plan::new(key.clone(), graph);
        info!("{} for {key}", plan.summary);
        Ok(plan)
    }

    /// Plans removal of everything in the stored graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn plan_destroy(&self, key: &StateKey) -> Result<Plan> {
        self.plan(key, &InfraGraph::new()).await
    }

    /// Applies a plan under the state lock and persists the result.
    ///
    /// The graph is saved and a history entry appended even when execution
    /// fails, so the next plan starts from what was actually applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, execution fails, or the
    /// result cannot be persisted.
    pub async fn apply(&self, plan: Plan) -> Result<ReconciliationResult> {
        self.run(plan, ApplyOperation::Apply).await
    }

    /// Destroys everything in the stored graph.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::apply`].
    pub async fn destroy(&self, key: &StateKey) -> Result<ReconciliationResult> {
        let plan = self.plan_destroy(key).await?;
        self.run(plan, ApplyOperation::Destroy).await
    }

    async fn run(&self, plan: Plan, operation: ApplyOperation) -> Result<ReconciliationResult> {
        let key = plan.key.clone();
        let lock = self.store.acquire_lock(&key, &operation.to_string()).await?;

        let outcome = self.run_locked(plan, operation).await;

        if let Err(e) = self.store.release_lock(&key, &lock.lock_id).await {
            warn!("Failed to release state lock on {key}: {e}");
        }
        outcome
    }

    async fn run_locked(&self, plan: Plan, operation: ApplyOperation) -> Result<ReconciliationResult> {
        let mut record = self.load(&plan.key).await?;
        let nodes = plan.changed_nodes();
        let Plan {
            key,
            mut graph,
            summary,
        } = plan;

        info!("Starting {operation} of {key}: {summary}");
        let executed = self.executor.apply(&mut graph, self.progress.as_ref()).await;

        let entry = match &executed {
            Ok(_) => ApplyHistoryEntry::new(operation, nodes),
            Err(e) => ApplyHistoryEntry::failed(operation, nodes, &e.to_string()),
        };
        record.set_graph(graph.clone());
        record.add_history(entry);

        if let Err(e) = self.store.save(&record).await {
            error!("Failed to save state for {key}: {e}");
            return Err(e);
        }

        match executed {
            Ok(report) => Ok(Self::result(summary, graph, &report)),
            Err(e) => {
                error!("{operation} of {key} failed: {e}");
                Err(InfraError::from(e))
            }
        }
    }

    fn result(summary: PlanSummary, graph: InfraGraph, report: &ExecutionReport) -> ReconciliationResult {
        let errors: Vec<String> = report
            .results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.id)))
            .collect();
        ReconciliationResult {
            success: errors.is_empty(),
            summary,
            applied: report.successful(),
            errors,
            graph,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datacenter::{DatacenterV1, ModuleSpec};
    use crate::graph::{NodeColor, NodeState};
    use crate::plugin::{ApplyResponse, MockModuleApplier};
    use crate::state::LocalStateStore;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn datacenter(name: &str) -> DatacenterSpec {
        let mut dc = DatacenterV1::default();
        dc.module.insert(
            "vpc".to_string(),
            ModuleSpec::new("acme/vpc:1").with_inputs(json!({ "name": name })),
        );
        DatacenterSpec::V1(dc)
    }

    fn target(name: &str) -> InfraGraph {
        compile(&datacenter(name), &AppGraph::new(), &GetGraphOptions::new("dc")).expect("compiles")
    }

    fn applier_ok() -> Arc<MockModuleApplier> {
        let mut applier = MockModuleApplier::new();
        applier.expect_apply().returning(|_, request| {
            Ok(ApplyResponse {
                state: Some(json!({ "destroyed": request.destroy })),
                outputs: json!({ "id": "vpc-123" }),
            })
        });
        Arc::new(applier)
    }

    #[tokio::test]
    async fn test_apply_persists_graph_and_history() {
        let temp = TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let reconciler = Reconciler::new(&store, GraphExecutor::new(applier_ok()));
        let key = StateKey::datacenter("dc");

        let plan = reconciler.plan(&key, &target("main")).await.expect("plan");
        assert_eq!(plan.summary.creates, 1);

        let result = reconciler.apply(plan).await.expect("apply");
        assert!(result.success);
        assert_eq!(result.applied, 1);

        let record = store.load(&key).await.expect("load").expect("saved");
        let node = record.graph.node("module/vpc@blue").expect("node");
        assert_eq!(node.status.state, NodeState::Complete);
        assert_eq!(record.history.len(), 1);
        assert!(!store.is_locked(&key).await.expect("locked"));
    }

    #[tokio::test]
    async fn test_second_plan_is_no_op() {
        let temp = TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let reconciler = Reconciler::new(&store, GraphExecutor::new(applier_ok()));
        let key = StateKey::datacenter("dc");

        let plan = reconciler.plan(&key, &target("main")).await.expect("plan");
        reconciler.apply(plan).await.expect("apply");

        let again = reconciler.plan(&key, &target("main")).await.expect("plan");
        assert!(!again.summary.has_changes());
        assert!(again.changed_nodes().is_empty());

        let changed = reconciler.plan(&key, &target("other")).await.expect("plan");
        assert_eq!(changed.summary.updates, 1);
    }

    #[tokio::test]
    async fn test_failed_apply_still_persists() {
        let temp = TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let mut applier = MockModuleApplier::new();
        applier
            .expect_apply()
            .returning(|_, _| Err(crate::error::PluginError::Remote { message: "denied".into() }));
        let reconciler = Reconciler::new(&store, GraphExecutor::new(Arc::new(applier)));
        let key = StateKey::datacenter("dc");

        let plan = reconciler.plan(&key, &target("main")).await.expect("plan");
        let err = reconciler.apply(plan).await.expect_err("fails");
        assert!(matches!(err, InfraError::Execution(_)));

        let record = store.load(&key).await.expect("load").expect("saved");
        assert_eq!(record.failed_nodes(), vec!["module/vpc@blue".to_string()]);
        let last = record.last_apply().expect("history");
        assert!(!last.success);
        assert!(!store.is_locked(&key).await.expect("locked"));
    }

    #[tokio::test]
    async fn test_apply_refuses_locked_state() {
        let temp = TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let reconciler = Reconciler::new(&store, GraphExecutor::new(applier_ok()));
        let key = StateKey::datacenter("dc");
        store.acquire_lock(&key, "apply").await.expect("lock");

        let plan = reconciler.plan(&key, &target("main")).await.expect("plan");
        let err = reconciler.apply(plan).await.expect_err("locked");
        assert!(err.is_retryable());
        assert!(!store.exists(&key).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_destroy_deletes_every_node() {
        let temp = TempDir::new().expect("tempdir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let reconciler = Reconciler::new(&store, GraphExecutor::new(applier_ok()));
        let key = StateKey::datacenter("dc");

        let plan = reconciler.plan(&key, &target("main")).await.expect("plan");
        reconciler.apply(plan).await.expect("apply");

        let result = reconciler.destroy(&key).await.expect("destroy");
        assert_eq!(result.summary.deletes, 1);

        let record = store.load(&key).await.expect("load").expect("saved");
        let node = record.graph.node("module/vpc@blue").expect("node");
        assert_eq!(node.action, NodeAction::Delete);
        assert_eq!(node.color(), NodeColor::Blue);
        assert_eq!(record.last_apply().map(|e| e.operation), Some(ApplyOperation::Destroy));

        let after = reconciler.plan_destroy(&key).await.expect("plan");
        assert!(!after.summary.has_changes());
    }
}
