//! Configuration validation.
//!
//! Field rules come from the `validator` derives on the config types; the
//! checks here are the ones that need more than one field or the filesystem.

use std::collections::HashSet;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{EngineConfig, StateBackend};
use crate::error::{ConfigError, Result};

/// Validation result containing all issues found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal issues.
    pub errors: Vec<ValidationIssue>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path of the field that failed.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    check_files: bool,
}

impl ConfigValidator {
    /// Creates a validator that also checks referenced files exist.
    #[must_use]
    pub const fn new() -> Self {
        Self { check_files: true }
    }

    /// Skips filesystem checks.
    #[must_use]
    pub const fn without_file_checks(mut self) -> Self {
        self.check_files = false;
        self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            flatten_errors("", &errors, &mut result.errors);
        }
        Self::validate_names(config, &mut result);
        Self::validate_state(config, &mut result);
        if self.check_files {
            Self::validate_files(config, &mut result);
        }

        match result.errors.first() {
            None => {
                debug!("Configuration validation passed");
                Ok(result)
            }
            Some(first) => Err(ConfigError::validation(first.message.clone(), first.field.clone()).into()),
        }
    }

    fn validate_names(config: &EngineConfig, result: &mut ValidationResult) {
        if !config.datacenter.name.is_empty() && !is_valid_name(&config.datacenter.name) {
            result.errors.push(ValidationIssue {
                field: String::from("datacenter.name"),
                message: format!(
                    "Datacenter name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    config.datacenter.name
                ),
            });
        }
        if let Some(env) = &config.environment
            && !env.name.is_empty()
            && !is_valid_name(&env.name)
        {
            result.errors.push(ValidationIssue {
                field: String::from("environment.name"),
                message: format!(
                    "Environment name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    env.name
                ),
            });
        }

        let mut seen = HashSet::new();
        for name in config.datacenter.variables.keys() {
            if !seen.insert(name.to_ascii_lowercase()) {
                result
                    .warnings
                    .push(format!("Variable '{name}' differs from another only by case"));
            }
        }
    }

    fn validate_state(config: &EngineConfig, result: &mut ValidationResult) {
        match config.state.backend {
            StateBackend::S3 => {
                if config.state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.errors.push(ValidationIssue {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
                if config.state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the S3 backend"));
                }
            }
            StateBackend::Local => {
                if config.state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_files(config: &EngineConfig, result: &mut ValidationResult) {
        if !config.datacenter.path.is_file() {
            result.errors.push(ValidationIssue {
                field: String::from("datacenter.path"),
                message: format!(
                    "Datacenter definition not found: {}",
                    config.datacenter.path.display()
                ),
            });
        }

        if let Some(env) = &config.environment {
            match &env.graph {
                Some(graph) if !graph.is_file() => result.errors.push(ValidationIssue {
                    field: String::from("environment.graph"),
                    message: format!("App graph not found: {}", graph.display()),
                }),
                Some(_) => {}
                None => result.warnings.push(format!(
                    "Environment '{}' has no app graph; only environment modules will be planned",
                    env.name
                )),
            }
        }

        if let Some(mount) = &config.plugins.mount
            && !mount.is_dir()
        {
            result.errors.push(ValidationIssue {
                field: String::from("plugins.mount"),
                message: format!("Plugin mount directory not found: {}", mount.display()),
            });
        }
    }
}

/// Turns nested derive errors into dotted-path issues.
fn flatten_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<ValidationIssue>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    out.push(ValidationIssue {
                        field: path.clone(),
                        message,
                    });
                }
            }
            ValidationErrorsKind::Struct(nested) => flatten_errors(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    flatten_errors(&format!("{path}[{index}]"), nested, out);
                }
            }
        }
    }
}

/// Names are lowercase alphanumeric with single hyphens, starting with a
/// letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
