//! Apply-time substitution of `${{ <node id>.<key> }}` references.

use serde_json::Value;
use std::collections::HashMap;

use super::context::{lookup_path, parse_path};
use super::template::map_expressions;
use crate::error::ExpressionError;

/// Splits `<node id>.<key>` at the first dot.
///
/// Node ids never contain dots, so everything after the first dot is the
/// output key (possibly a nested path).
#[must_use]
pub fn split_reference(expr: &str) -> Option<(&str, &str)> {
    let (id, key) = expr.split_once('.')?;
    if id.is_empty() || key.is_empty() || id.chars().any(char::is_whitespace) {
        return None;
    }
    Some((id, key))
}

/// Replaces every reference token in `value` with the referenced output.
///
/// `outputs` maps node ids of completed nodes to their outputs.
///
/// # Errors
///
/// Fails on the first token that is not a reference, names a node with no
/// outputs, or names a key the outputs lack.
pub fn replace_refs_with_output_values(
    value: &Value,
    outputs: &HashMap<String, Value>,
) -> Result<Value, ExpressionError> {
    map_expressions(value, &mut |expr| {
        let (node_id, key) =
            split_reference(expr).ok_or_else(|| ExpressionError::InvalidReference {
                expression: expr.to_string(),
            })?;
        let node_outputs = outputs
            .get(node_id)
            .ok_or_else(|| ExpressionError::MissingOutputs {
                node_id: node_id.to_string(),
            })?;

        let found = node_outputs.get(key).or_else(|| {
            parse_path(key).and_then(|path| lookup_path(node_outputs, &path))
        });
        found
            .cloned()
            .map(Some)
            .ok_or_else(|| ExpressionError::MissingOutputKey {
                node_id: node_id.to_string(),
                key: key.to_string(),
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        HashMap::from([
            (
                "module/vpc@blue".to_string(),
                json!({ "id": "vpc-123", "cidr": { "block": "10.0.0.0/16" } }),
            ),
            ("module/db@green".to_string(), json!({ "port": 5432 })),
        ])
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("module/vpc@blue.id"), Some(("module/vpc@blue", "id")));
        assert_eq!(split_reference("a.b.c"), Some(("a", "b.c")));
        assert_eq!(split_reference("novalue"), None);
        assert_eq!(split_reference("a b.c"), None);
    }

    #[test]
    fn test_replaces_nested_and_array_tokens() {
        let inputs = json!({
            "vpc": "${{ module/vpc@blue.id }}",
            "rules": [
                { "port": "${{ module/db@green.port }}" },
                "cidr=${{ module/vpc@blue.cidr.block }}"
            ],
            "plain": "untouched"
        });

        let resolved = replace_refs_with_output_values(&inputs, &outputs()).expect("resolves");
        assert_eq!(
            resolved,
            json!({
                "vpc": "vpc-123",
                "rules": [{ "port": 5432 }, "cidr=10.0.0.0/16"],
                "plain": "untouched"
            })
        );
    }

    #[test]
    fn test_missing_node_is_error() {
        let inputs = json!({ "x": "${{ module/other@blue.id }}" });
        match replace_refs_with_output_values(&inputs, &outputs()) {
            Err(ExpressionError::MissingOutputs { node_id }) => {
                assert_eq!(node_id, "module/other@blue");
            }
            other => panic!("expected missing outputs, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_key_is_error() {
        let inputs = json!(["${{ module/vpc@blue.name }}"]);
        match replace_refs_with_output_values(&inputs, &outputs()) {
            Err(ExpressionError::MissingOutputKey { key, .. }) => assert_eq!(key, "name"),
            other => panic!("expected missing key, got {other:?}"),
        }
    }
}
