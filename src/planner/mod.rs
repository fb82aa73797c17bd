//! Planning and applying infrastructure graphs.
//!
//! [`GraphPlanner`] diffs a freshly compiled graph against the last applied
//! one; [`GraphExecutor`] applies the result through the module plugins.

mod executor;
mod hash;
mod plan;

pub use executor::{ExecutionReport, ExecutorOptions, GraphExecutor, NodeResult};
pub use hash::NodeHasher;
pub use plan::{GraphPlanner, PlanSummary};
