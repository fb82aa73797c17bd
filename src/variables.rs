//! Datacenter variables: dependency extraction, ordering and resolution.
//!
//! A variable's metadata fields may reference other variables
//! (`default: "${ variable.region }-db"`). Those references define a graph
//! that is sorted depth-first so every variable is resolved after the
//! variables it depends on.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

use crate::error::CompileError;
use crate::expression::{Context, PathSegment, parse_path, visit_expressions};

/// Scope names that refer to datacenter variables.
pub const VARIABLE_SCOPES: [&str; 3] = ["variable", "var", "variables"];

/// A metadata field that references another variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDependency {
    /// Metadata field holding the reference.
    pub key: String,
    /// Referenced variable name.
    pub value: String,
}

/// A declared variable and its metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariableMetadata {
    /// Value type (`string`, `number`, `boolean`, or a resource type).
    #[serde(rename = "type", default = "default_type")]
    pub variable_type: String,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default value, possibly referencing other variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Other variables referenced by this variable's metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependant_variables: Vec<VariableDependency>,
    /// Any other metadata fields.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

fn default_type() -> String {
    "string".to_string()
}

impl VariableMetadata {
    /// Creates metadata of the given type.
    #[must_use]
    pub fn new(variable_type: impl Into<String>) -> Self {
        Self {
            variable_type: variable_type.into(),
            ..Self::default()
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets an extra metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set_field(&key.into(), value);
        self
    }

    /// Reads a metadata field by name.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "type" => Some(Value::String(self.variable_type.clone())),
            "description" => self.description.clone().map(Value::String),
            "default" => self.default.clone(),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Writes a metadata field by name.
    pub fn set_field(&mut self, key: &str, value: Value) {
        match key {
            "type" => {
                if let Value::String(s) = value {
                    self.variable_type = s;
                }
            }
            "description" => {
                self.description = match value {
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                };
            }
            "default" => self.default = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    /// Every metadata field as `(name, value)`, including structured ones.
    fn fields(&self) -> Vec<(String, Value)> {
        let mut fields = vec![("type".to_string(), Value::String(self.variable_type.clone()))];
        if let Some(description) = &self.description {
            fields.push(("description".to_string(), Value::String(description.clone())));
        }
        if let Some(default) = &self.default {
            fields.push(("default".to_string(), default.clone()));
        }
        fields.extend(self.extra.iter().map(|(key, value)| (key.clone(), value.clone())));
        fields
    }
}

/// Variable name to metadata, with `dependant_variables` filled in.
pub type DatacenterVariablesSchema = IndexMap<String, VariableMetadata>;

/// One entry of a sorted variable list.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedVariable {
    /// Variable name.
    pub name: String,
    /// Variable metadata.
    pub metadata: VariableMetadata,
    /// Names of the variables this one directly depends on.
    pub dependencies: BTreeSet<String>,
}

/// Returns the variable named by a `variable.<name>` style expression.
fn referenced_variable(expr: &str) -> Option<String> {
    let path = parse_path(expr)?;
    match path.as_slice() {
        [PathSegment::Field(root), PathSegment::Field(name), ..]
            if VARIABLE_SCOPES.contains(&root.as_str()) =>
        {
            Some(name.clone())
        }
        _ => None,
    }
}

/// Builds the schema from declared variables, recording every metadata
/// field that references another variable.
///
/// # Errors
///
/// Returns [`CompileError::UnknownVariable`] for references to undeclared
/// variables.
pub fn variables_schema(
    declared: &IndexMap<String, VariableMetadata>,
) -> Result<DatacenterVariablesSchema, CompileError> {
    let mut schema = declared.clone();

    for (name, metadata) in &mut schema {
        metadata.dependant_variables.clear();
        for (key, value) in metadata.fields() {
            let mut references = Vec::new();
            visit_expressions(&value, &mut |expr| {
                if let Some(reference) = referenced_variable(expr) {
                    references.push(reference);
                }
            });
            for reference in references {
                if !declared.contains_key(&reference) {
                    return Err(CompileError::UnknownVariable {
                        variable: name.clone(),
                        reference,
                    });
                }
                metadata.dependant_variables.push(VariableDependency {
                    key: key.clone(),
                    value: reference,
                });
            }
        }
    }
    Ok(schema)
}

/// Orders variables so each comes after everything it depends on.
///
/// # Errors
///
/// Returns [`CompileError::CircularVariableDependency`] naming the variable
/// being visited and the one found on the stack.
pub fn sort_variables(
    schema: &DatacenterVariablesSchema,
) -> Result<Vec<SortedVariable>, CompileError> {
    let graph: IndexMap<&str, BTreeSet<String>> = schema
        .iter()
        .map(|(name, metadata)| {
            let dependencies = metadata
                .dependant_variables
                .iter()
                .map(|dependency| dependency.value.clone())
                .collect();
            (name.as_str(), dependencies)
        })
        .collect();

    let mut discovered = HashSet::new();
    let mut finished = HashSet::new();
    let mut order = Vec::with_capacity(graph.len());

    for name in graph.keys() {
        if !finished.contains(*name) {
            visit(&graph, name, &mut discovered, &mut finished, &mut order)?;
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|name| {
            let metadata = schema.get(&name)?.clone();
            let dependencies = graph.get(name.as_str()).cloned().unwrap_or_default();
            Some(SortedVariable {
                name,
                metadata,
                dependencies,
            })
        })
        .collect())
}

fn visit(
    graph: &IndexMap<&str, BTreeSet<String>>,
    node: &str,
    discovered: &mut HashSet<String>,
    finished: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<(), CompileError> {
    discovered.insert(node.to_string());

    for edge in graph.get(node).into_iter().flatten() {
        if discovered.contains(edge) {
            return Err(CompileError::CircularVariableDependency {
                from: node.to_string(),
                to: edge.clone(),
            });
        }
        if !finished.contains(edge) {
            visit(graph, edge, discovered, finished, order)?;
        }
    }

    discovered.remove(node);
    finished.insert(node.to_string());
    order.push(node.to_string());
    Ok(())
}

fn variable_context(values: &Map<String, Value>, strict: bool) -> Context {
    VARIABLE_SCOPES.iter().fold(Context::new(), |context, scope| {
        if strict {
            context.with_strict_scope(*scope, Value::Object(values.clone()))
        } else {
            context.with_scope(*scope, Value::Object(values.clone()))
        }
    })
}

/// Resolves variable values in dependency order.
///
/// Overrides win over defaults. Defaults are interpolated against the
/// variables resolved before them, and each resolved value is written into
/// the metadata fields of the variables that reference it. Variables with
/// neither an override nor a default are left out of the result.
///
/// # Errors
///
/// Fails on cycles, or when a default references a variable without value.
pub fn resolve_variables(
    schema: &DatacenterVariablesSchema,
    overrides: &IndexMap<String, Value>,
) -> Result<IndexMap<String, Value>, CompileError> {
    let mut sorted = sort_variables(schema)?;
    let mut values = Map::new();

    for index in 0..sorted.len() {
        let (done, rest) = sorted.split_at_mut(index + 1);
        let current = &done[index];

        let value = match overrides.get(&current.name) {
            Some(value) => Some(value.clone()),
            None => match &current.metadata.default {
                Some(default) => Some(variable_context(&values, true).apply(default)?),
                None => None,
            },
        };
        let Some(value) = value else {
            continue;
        };

        let single = Map::from_iter([(current.name.clone(), value.clone())]);
        let propagate = variable_context(&single, false);
        for next in rest.iter_mut().filter(|next| next.dependencies.contains(&current.name)) {
            let keys: Vec<String> = next
                .metadata
                .dependant_variables
                .iter()
                .filter(|dependency| dependency.value == current.name)
                .map(|dependency| dependency.key.clone())
                .collect();
            for key in keys {
                if let Some(field) = next.metadata.field(&key) {
                    let filled = propagate.apply(&field)?;
                    next.metadata.set_field(&key, filled);
                }
            }
        }

        values.insert(current.name.clone(), value);
    }

    Ok(values.into_iter().collect())
}

/// Names of declared variables that have no value in `values`.
#[must_use]
pub fn missing_variables(
    schema: &DatacenterVariablesSchema,
    values: &IndexMap<String, Value>,
) -> Vec<String> {
    schema
        .keys()
        .filter(|name| !values.contains_key(*name))
        .cloned()
        .collect()
}
