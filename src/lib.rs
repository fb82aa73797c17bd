// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::missing_const_for_fn)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::module_inception)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::shadow_unrelated)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # infragraph
//!
//! A graph-based infrastructure engine. A datacenter definition describes
//! which provisioning modules exist and how application resources map onto
//! them; an application graph lists the resources an environment needs.
//!
//! ## Pipeline
//!
//! 1. **Compile**: the datacenter evaluates its hooks against the
//!    application graph and produces an [`InfraGraph`] of modules.
//! 2. **Plan**: [`GraphPlanner`] diffs the compiled graph against the last
//!    applied one and marks every module create, update, delete or no-op.
//! 3. **Apply**: [`GraphExecutor`] walks the graph in dependency order,
//!    resolving `${{ module.x.y }}` references from upstream outputs and
//!    calling the module plugins.
//! 4. **Persist**: [`Reconciler`] stores the applied graph per datacenter
//!    and environment, behind a lock.
//!
//! ## Modules
//!
//! - [`graph`]: generic graph plus app and infrastructure node types
//! - [`expression`]: `${{ }}` templates, references and evaluation
//! - [`variables`]: datacenter variable schemas and resolution
//! - [`datacenter`]: datacenter definitions and graph compilation
//! - [`planner`]: diffing and execution
//! - [`plugin`]: module plugin protocol and the docker-backed manager
//! - [`state`]: state storage backends (local, S3)
//! - [`reconciler`]: plan/apply/destroy against stored state
//! - [`config`]: engine configuration
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! # infragraph.yaml
//! datacenter:
//!   name: aws-prod
//!   path: datacenter.yml
//!   variables:
//!     region: us-east-1
//! environment:
//!   name: staging
//!   graph: staging.graph.yml
//! state:
//!   backend: local
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod datacenter;
pub mod error;
pub mod expression;
pub mod graph;
pub mod planner;
pub mod plugin;
pub mod reconciler;
pub mod state;
pub mod variables;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use datacenter::{DatacenterCompiler, DatacenterSpec, GetGraphOptions};
pub use error::{InfraError, Result};
pub use graph::{AppGraph, AppGraphNode, Graph, GraphEdge, GraphNode, InfraGraph, InfraGraphNode, NodeKey};
pub use planner::{ExecutionReport, GraphExecutor, GraphPlanner, PlanSummary};
pub use plugin::{ModuleApplier, ModuleBuilder, PluginKind, PluginManager};
pub use reconciler::{Plan, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateKey, StateRecord, StateStore};
