//! Datacenter definitions and their compilation into infrastructure graphs.
//!
//! A datacenter declares modules at three levels:
//!
//! - root modules, created once per datacenter
//! - environment modules, created once per environment
//! - resource hooks, instantiated once per matching app graph node
//!
//! Modules may reference modules of their own scope or an enclosing one
//! through `module.<name>.<key>` expressions.

mod compiler;
mod outputs;
mod spec;

pub use compiler::DatacenterCompiler;
pub use outputs::{missing_outputs, required_outputs};
pub use spec::{
    DatacenterSpec, DatacenterV1, EnvironmentSpec, GetGraphOptions, ModuleSpec, ResourceHook,
};
