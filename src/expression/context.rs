//! Dotted paths and the explicit scope table used by compile-time passes.

use serde_json::{Map, Value};
use std::collections::HashSet;

use super::template::map_expressions;
use crate::error::CompileError;

/// One step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object field (or array index written as `.0`).
    Field(String),
    /// Array index written as `[0]`.
    Index(usize),
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parses `root.field[0].other` into segments.
///
/// Returns `None` if the expression is anything other than a plain path.
#[must_use]
pub fn parse_path(expr: &str) -> Option<Vec<PathSegment>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut segments = Vec::new();
    let mut pos = 0;

    let read_word = |pos: &mut usize| -> Option<String> {
        let start = *pos;
        while *pos < chars.len() && is_ident_char(chars[*pos]) {
            *pos += 1;
        }
        (*pos > start).then(|| chars[start..*pos].iter().collect())
    };

    if !chars.first().copied().is_some_and(is_ident_start) {
        return None;
    }
    segments.push(PathSegment::Field(read_word(&mut pos)?));

    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                pos += 1;
                segments.push(PathSegment::Field(read_word(&mut pos)?));
            }
            '[' => {
                let close = chars[pos..].iter().position(|c| *c == ']')? + pos;
                let inner: String = chars[pos + 1..close].iter().collect();
                let inner = inner.trim();
                let segment = if let Ok(index) = inner.parse::<usize>() {
                    PathSegment::Index(index)
                } else {
                    let unquoted = inner
                        .strip_prefix('"')
                        .and_then(|s| s.strip_suffix('"'))
                        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))?;
                    PathSegment::Field(unquoted.to_string())
                };
                segments.push(segment);
                pos = close + 1;
            }
            _ => return None,
        }
    }
    Some(segments)
}

/// Follows `path` into `value`.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match (current, segment) {
        (Value::Object(fields), PathSegment::Field(name)) => fields.get(name),
        (Value::Object(fields), PathSegment::Index(index)) => fields.get(&index.to_string()),
        (Value::Array(items), PathSegment::Index(index)) => items.get(*index),
        (Value::Array(items), PathSegment::Field(name)) => {
            name.parse::<usize>().ok().and_then(|index| items.get(index))
        }
        _ => None,
    })
}

/// Named scopes available to compile-time interpolation.
///
/// Only plain paths whose root is a registered scope are substituted; other
/// tokens are left for later passes. Paths into a strict scope that do not
/// resolve are errors.
#[derive(Debug, Clone, Default)]
pub struct Context {
    scopes: Map<String, Value>,
    strict: HashSet<String>,
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scope.
    #[must_use]
    pub fn with_scope(mut self, name: impl Into<String>, value: Value) -> Self {
        self.scopes.insert(name.into(), value);
        self
    }

    /// Adds a variable scope: unresolvable paths into it are errors.
    #[must_use]
    pub fn with_strict_scope(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.strict.insert(name.clone());
        self.scopes.insert(name, value);
        self
    }

    /// Returns true if `name` is a registered scope.
    #[must_use]
    pub fn has_scope(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// The whole context as one object, for the expression evaluator.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.scopes.clone())
    }

    /// Resolves a single expression.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::UnresolvedVariable`] for a missing path in a
    /// strict scope.
    pub fn resolve(&self, expr: &str) -> Result<Option<Value>, CompileError> {
        let Some(path) = parse_path(expr) else {
            return Ok(None);
        };
        let Some(PathSegment::Field(root)) = path.first() else {
            return Ok(None);
        };
        let Some(scope) = self.scopes.get(root) else {
            return Ok(None);
        };

        match lookup_path(scope, &path[1..]) {
            Some(value) if !(value.is_null() && self.strict.contains(root)) => {
                Ok(Some(value.clone()))
            }
            _ if self.strict.contains(root) => {
                let name = match path.get(1) {
                    Some(PathSegment::Field(name)) => name.clone(),
                    _ => expr.to_string(),
                };
                Err(CompileError::UnresolvedVariable { name })
            }
            _ => Ok(None),
        }
    }

    /// Substitutes every resolvable token in `value`.
    ///
    /// # Errors
    ///
    /// See [`Context::resolve`].
    pub fn apply(&self, value: &Value) -> Result<Value, CompileError> {
        map_expressions(value, &mut |expr| self.resolve(expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("node.inputs[0].name"),
            Some(vec![
                PathSegment::Field("node".to_string()),
                PathSegment::Field("inputs".to_string()),
                PathSegment::Index(0),
                PathSegment::Field("name".to_string()),
            ])
        );
        assert_eq!(
            parse_path("var['my-region']"),
            Some(vec![
                PathSegment::Field("var".to_string()),
                PathSegment::Field("my-region".to_string()),
            ])
        );
        assert_eq!(parse_path("node.type == 'x'"), None);
        assert_eq!(parse_path("shop/service/api.url"), None);
        assert_eq!(parse_path("1abc"), None);
    }

    #[test]
    fn test_lookup_path_arrays() {
        let value = json!({ "list": [{ "a": 1 }, { "a": 2 }] });
        let path = parse_path("list.1.a").expect("path");
        assert_eq!(lookup_path(&value, &path), Some(&json!(2)));
    }

    #[test]
    fn test_apply_leaves_unknown_scopes() {
        let context = Context::new()
            .with_scope("datacenter", json!({ "name": "prod" }))
            .with_strict_scope("variable", json!({ "region": "nyc1" }));

        let value = json!({
            "name": "${{ datacenter.name }}-${ variable.region }",
            "vpc": "${{ module.vpc.id }}"
        });
        let applied = context.apply(&value).expect("resolves");
        assert_eq!(applied["name"], "prod-nyc1");
        assert_eq!(applied["vpc"], "${{ module.vpc.id }}");
    }

    #[test]
    fn test_strict_scope_missing_is_error() {
        let context = Context::new().with_strict_scope("var", json!({}));
        match context.apply(&json!("${ var.missing }")) {
            Err(CompileError::UnresolvedVariable { name }) => assert_eq!(name, "missing"),
            other => panic!("expected unresolved variable, got {other:?}"),
        }
    }
}
