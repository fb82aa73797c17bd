//! Error types for the infragraph orchestrator.
//!
//! This module provides the error hierarchy for every stage of a planning
//! cycle: graph construction, expression resolution, datacenter compilation,
//! execution, plugin communication, state management and configuration.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for infragraph.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Graph structure errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Expression and template errors.
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// Datacenter compilation errors.
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Graph execution errors.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Module plugin errors.
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Graph structure errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node lookup failed.
    #[error("Node not found: {id}")]
    NodeNotFound {
        /// Id of the missing node.
        id: String,
    },

    /// No edge matched the removal filter.
    #[error("Edge not found: {from} -> {to}")]
    EdgeNotFound {
        /// Source filter (`*` when unset).
        from: String,
        /// Target filter (`*` when unset).
        to: String,
    },

    /// An edge points at a node that is not in the graph.
    #[error("Edge {from} -> {to} references missing node {missing}")]
    DanglingEdge {
        /// Edge source.
        from: String,
        /// Edge target.
        to: String,
        /// The endpoint that could not be found.
        missing: String,
    },

    /// The graph contains a dependency cycle.
    #[error("Dependency cycle detected between: {}", .nodes.join(", "))]
    Cycle {
        /// Nodes that could not be ordered.
        nodes: Vec<String>,
    },
}

/// Expression and template errors.
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// An expression could not be parsed.
    #[error("Failed to parse expression '{expression}': {message}")]
    Parse {
        /// The expression text.
        expression: String,
        /// Description of the parse failure.
        message: String,
    },

    /// An expression could not be evaluated.
    #[error("Failed to evaluate expression '{expression}': {message}")]
    Evaluation {
        /// The expression text.
        expression: String,
        /// Description of the evaluation failure.
        message: String,
    },

    /// A token is not a `<node id>.<key>` reference.
    #[error("Invalid output reference: {expression}")]
    InvalidReference {
        /// The expression text.
        expression: String,
    },

    /// The referenced node has not completed or has no outputs.
    #[error("Missing outputs for {node_id}")]
    MissingOutputs {
        /// Referenced node id.
        node_id: String,
    },

    /// The referenced node completed but lacks the requested key.
    #[error("Invalid output key {key} for {node_id}")]
    MissingOutputKey {
        /// Referenced node id.
        node_id: String,
        /// Requested output key.
        key: String,
    },
}

/// Datacenter and component compilation errors.
///
/// Any of these aborts graph construction; no partial graph is returned.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Two modules share a name within one scope.
    #[error("Duplicate module name: {name}")]
    DuplicateModule {
        /// The duplicated module name.
        name: String,
    },

    /// A module references a module outside of its visible scopes.
    #[error("Module {module} references unknown or out-of-scope module {reference}")]
    InvalidModuleReference {
        /// The referencing module.
        module: String,
        /// The referenced module name.
        reference: String,
    },

    /// A resource hook's outputs lack required fields.
    #[error("Invalid outputs for {resource_type} hook on {node}: missing {}", .missing.join(", "))]
    InvalidOutputProperties {
        /// Resource type of the hook.
        resource_type: String,
        /// App node the hook was instantiated for.
        node: String,
        /// Required fields not present.
        missing: Vec<String>,
    },

    /// An app graph edge targets a node no hook produced outputs for.
    #[error("Missing resource hook for {node} (required by {from})")]
    MissingResourceHook {
        /// Target app node id.
        node: String,
        /// App node that depends on it.
        from: String,
    },

    /// A `when` clause referenced module outputs.
    #[error("Module references are not allowed in when clauses ({resource_type}: {clause})")]
    ModuleReferencesNotAllowedInWhenClause {
        /// Resource type of the hook.
        resource_type: String,
        /// The offending clause.
        clause: String,
    },

    /// A `when` clause did not evaluate to a boolean.
    #[error("Invalid when clause '{clause}': {message}")]
    InvalidWhenClause {
        /// The offending clause.
        clause: String,
        /// Description of the problem.
        message: String,
    },

    /// Variables reference each other in a cycle.
    #[error("Circular dependency detected between variables {from} and {to}")]
    CircularVariableDependency {
        /// Variable being visited.
        from: String,
        /// Variable already on the stack.
        to: String,
    },

    /// A variable's metadata references an undeclared variable.
    #[error("Variable {variable} references unknown variable {reference}")]
    UnknownVariable {
        /// Declaring variable.
        variable: String,
        /// Referenced name.
        reference: String,
    },

    /// A referenced variable has no value.
    #[error("Variable {name} has no value")]
    UnresolvedVariable {
        /// Variable name.
        name: String,
    },

    /// A component references a dependency it does not declare.
    #[error("Unknown dependency: {dependency}")]
    InvalidDependencyReference {
        /// Dependency name.
        dependency: String,
    },

    /// A token survived compilation without resolving to a node reference.
    #[error("Unresolved expression in {node}: {expression}")]
    UnresolvedExpression {
        /// Node owning the token.
        node: String,
        /// The token expression.
        expression: String,
    },

    /// The datacenter declares an unknown schema version.
    #[error("Unsupported datacenter version: {version}")]
    UnsupportedVersion {
        /// Declared version.
        version: String,
    },

    /// The datacenter document does not match the schema.
    #[error("Invalid datacenter definition: {message}")]
    InvalidDefinition {
        /// Description of the problem.
        message: String,
    },

    /// Graph errors raised while assembling the result.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Template errors raised while interpolating.
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Graph execution errors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A node's inputs reference outputs that are not available.
    #[error("Unresolved reference in {node}: {source}")]
    UnresolvedReference {
        /// Node being applied.
        node: String,
        /// Underlying resolution failure.
        #[source]
        source: ExpressionError,
    },

    /// The plugin failed to apply a node.
    #[error("Failed to apply {node}: {message}")]
    NodeFailed {
        /// Node being applied.
        node: String,
        /// Message returned by the plugin.
        message: String,
    },

    /// The scheduler stopped with nodes left incomplete.
    #[error("Execution finished with incomplete nodes: {}", .pending.join(", "))]
    InvariantViolation {
        /// Nodes that never completed.
        pending: Vec<String>,
    },

    /// A worker task panicked or was cancelled.
    #[error("Apply task failed: {message}")]
    TaskFailed {
        /// Description of the failure.
        message: String,
    },
}

/// Module plugin errors.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin container could not be started.
    #[error("Failed to start {plugin} plugin: {message}")]
    ServerStart {
        /// Plugin kind.
        plugin: String,
        /// Description of the failure.
        message: String,
    },

    /// The bound port of a plugin container could not be determined.
    #[error("Failed to discover port for {plugin} plugin: {message}")]
    PortDiscovery {
        /// Plugin kind.
        plugin: String,
        /// Description of the failure.
        message: String,
    },

    /// The WebSocket connection failed.
    #[error("Plugin connection failed: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// A frame did not follow the protocol.
    #[error("Plugin protocol error: {message}")]
    Protocol {
        /// Description of the failure.
        message: String,
    },

    /// The plugin reported an error.
    #[error("{message}")]
    Remote {
        /// Message returned by the plugin.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local state file could not be read or written.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A document has an extension we cannot parse.
    #[error("Unsupported document format: {path}")]
    UnsupportedFormat {
        /// Path of the document.
        path: PathBuf,
    },
}

/// Result type alias for infragraph operations.
pub type Result<T> = std::result::Result<T, InfraError>;

impl InfraError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Plugin(PluginError::Connection { .. })
                | Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Plugin(PluginError::Connection { .. }) => Some(3),
            Self::State(StateError::LockFailed { .. } | StateError::LockedByOther { .. }) => {
                Some(2)
            }
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl PluginError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl CompileError {
    /// Creates an invalid definition error.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let err = InfraError::from(PluginError::connection("refused"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(3));

        let err = InfraError::from(CompileError::DuplicateModule {
            name: "vpc".to_string(),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_list_messages() {
        let err = CompileError::InvalidOutputProperties {
            resource_type: "database".to_string(),
            node: "api/database/main".to_string(),
            missing: vec!["host".to_string(), "port".to_string()],
        };
        assert!(err.to_string().ends_with("missing host, port"));
    }
}
