//! Template interpolation.
//!
//! Two passes share the `${{ ... }}` token grammar:
//!
//! - compile time, symbolic scopes are rewritten into node references
//!   ([`Context`], [`ComponentScope`]) and hook guards are evaluated
//!   ([`Expression`])
//! - apply time, node references are replaced by the outputs of completed
//!   nodes ([`replace_refs_with_output_values`])

pub mod component;
pub mod context;
pub mod eval;
pub mod refs;
pub mod template;

pub use component::ComponentScope;
pub use context::{Context, PathSegment, lookup_path, parse_path};
pub use eval::Expression;
pub use refs::{replace_refs_with_output_values, split_reference};
pub use template::{
    Segment, Template, map_expressions, render_token, unescape_literals, visit_expressions,
};
