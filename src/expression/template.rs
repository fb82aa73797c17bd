//! Template token scanning and typed substitution over value trees.
//!
//! Tokens are written `${{ expr }}`. The HCL-style `${ expr }` form is
//! accepted on input and rendered back in the canonical form whenever a
//! string is rewritten. `$${` is a literal `${`; it survives every
//! substitution pass and is only unescaped by [`unescape_literals`] when
//! inputs are handed to a plugin.

use serde_json::{Map, Value};

/// A piece of a parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// Trimmed expression between delimiters.
    Expr(String),
}

/// A string split into literal and expression segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parses a string. Unterminated openers are kept as literal text.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            if rest[..start].ends_with('$') {
                text.push_str(&rest[..start + 2]);
                rest = &rest[start + 2..];
                continue;
            }
            let after = &rest[start + 2..];
            let token = if let Some(inner) = after.strip_prefix('{') {
                inner.find("}}").map(|end| (&inner[..end], 3 + end + 2))
            } else {
                find_closing_brace(after).map(|end| (&after[..end], 2 + end + 1))
            };

            match token {
                Some((expr, consumed)) => {
                    text.push_str(&rest[..start]);
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Expr(expr.trim().to_string()));
                    rest = &rest[start + consumed..];
                }
                None => break,
            }
        }

        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Self { segments }
    }

    /// The parsed segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Iterates the expressions in order.
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Expr(expr) => Some(expr.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Returns true if the template contains at least one token.
    #[must_use]
    pub fn has_expressions(&self) -> bool {
        self.expressions().next().is_some()
    }

    /// Returns the expression if the template is exactly one token.
    #[must_use]
    pub fn single_expression(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Expr(expr)] => Some(expr),
            _ => None,
        }
    }
}

/// Finds the `}` closing an HCL-style token, skipping nested braces and
/// quoted strings.
fn find_closing_brace(input: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (index, c) in input.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(index),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Renders an expression as a canonical token.
#[must_use]
pub fn render_token(expr: &str) -> String {
    format!("${{{{ {expr} }}}}")
}

/// Converts a value to the text spliced into a surrounding string.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Walks every string leaf of `value` and substitutes tokens.
///
/// `resolve` receives each trimmed expression. `Ok(Some(v))` replaces the
/// token, `Ok(None)` leaves it in place. A string made of exactly one token
/// takes the replacement's type; otherwise the replacement is spliced in as
/// text.
///
/// # Errors
///
/// Propagates the first error returned by `resolve`.
pub fn map_expressions<E, F>(value: &Value, resolve: &mut F) -> Result<Value, E>
where
    F: FnMut(&str) -> Result<Option<Value>, E>,
{
    match value {
        Value::String(s) => map_string(s, resolve),
        Value::Array(items) => items
            .iter()
            .map(|item| map_expressions(item, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut mapped = Map::with_capacity(fields.len());
            for (key, item) in fields {
                mapped.insert(key.clone(), map_expressions(item, resolve)?);
            }
            Ok(Value::Object(mapped))
        }
        other => Ok(other.clone()),
    }
}

fn map_string<E, F>(input: &str, resolve: &mut F) -> Result<Value, E>
where
    F: FnMut(&str) -> Result<Option<Value>, E>,
{
    let template = Template::parse(input);
    if !template.has_expressions() {
        return Ok(Value::String(input.to_string()));
    }

    if let Some(expr) = template.single_expression() {
        return Ok(resolve(expr)?.unwrap_or_else(|| Value::String(render_token(expr))));
    }

    let mut out = String::with_capacity(input.len());
    for segment in template.segments() {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Expr(expr) => match resolve(expr)? {
                Some(value) => out.push_str(&stringify(&value)),
                None => out.push_str(&render_token(expr)),
            },
        }
    }
    Ok(Value::String(out))
}

/// Turns every `$${` escape in the tree into a literal `${`.
#[must_use]
pub fn unescape_literals(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("$${", "${")),
        Value::Array(items) => Value::Array(items.iter().map(unescape_literals).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), unescape_literals(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Calls `visit` for every expression in the tree.
pub fn visit_expressions(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => {
            for expr in Template::parse(s).expressions() {
                visit(expr);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| visit_expressions(item, visit)),
        Value::Object(fields) => fields.values().for_each(|item| visit_expressions(item, visit)),
        _ => {}
    }
}
