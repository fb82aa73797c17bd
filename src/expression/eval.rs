//! Restricted expression interpreter for hook `when` clauses.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := unary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) unary )?
//! unary   := "!" unary | primary
//! primary := literal | call | path | "(" expr ")"
//! call    := ident "(" ( expr ( "," expr )* )? ")"
//! path    := ident ( "." ident | "." number | "[" ( number | string ) "]" )*
//! ```
//!
//! Paths read from a context object and evaluate to `null` when absent.
//! Nothing here can reach the host environment.

use serde_json::{Number, Value};

use super::context::{PathSegment, lookup_path};
use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// Builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `contains(haystack, needle)`: substring, array element or object key.
    Contains,
    /// `startsWith(s, prefix)`
    StartsWith,
    /// `endsWith(s, suffix)`
    EndsWith,
    /// `toLower(s)`
    ToLower,
    /// `toUpper(s)`
    ToUpper,
    /// `trim(s)`
    Trim,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "contains" => Some(Self::Contains),
            "startsWith" => Some(Self::StartsWith),
            "endsWith" => Some(Self::EndsWith),
            "toLower" => Some(Self::ToLower),
            "toUpper" => Some(Self::ToUpper),
            "trim" => Some(Self::Trim),
            _ => None,
        }
    }

    const fn arity(self) -> usize {
        match self {
            Self::Contains | Self::StartsWith | Self::EndsWith => 2,
            Self::ToLower | Self::ToUpper | Self::Trim => 1,
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Context lookup.
    Path(Vec<PathSegment>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Builtin call.
    Call {
        /// Function.
        function: Function,
        /// Arguments.
        args: Vec<Expr>,
    },
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] on malformed input or unknown
    /// functions.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let fail = |message: String| ExpressionError::Parse {
            expression: source.to_string(),
            message,
        };
        let tokens = tokenize(source).map_err(fail)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or().map_err(fail)?;
        if let Some(token) = parser.peek() {
            return Err(fail(format!("unexpected token {token:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// The source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if any path in the expression starts at `scope`.
    #[must_use]
    pub fn references_scope(&self, scope: &str) -> bool {
        fn walk(expr: &Expr, scope: &str) -> bool {
            match expr {
                Expr::Literal(_) => false,
                Expr::Path(path) => {
                    matches!(path.first(), Some(PathSegment::Field(root)) if root == scope)
                }
                Expr::Not(inner) => walk(inner, scope),
                Expr::Binary { left, right, .. } => walk(left, scope) || walk(right, scope),
                Expr::Call { args, .. } => args.iter().any(|arg| walk(arg, scope)),
            }
        }
        walk(&self.ast, scope)
    }

    /// Evaluates against a context object.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Evaluation`] when operand types do not fit
    /// the operator.
    pub fn evaluate(&self, context: &Value) -> Result<Value, ExpressionError> {
        eval(&self.ast, context).map_err(|message| ExpressionError::Evaluation {
            expression: self.source.clone(),
            message,
        })
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let next = chars.get(pos + 1).copied();
        match c {
            c if c.is_whitespace() => pos += 1,
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                pos += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                pos += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                pos += if chars.get(pos + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                pos += if chars.get(pos + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                pos += 1;
            }
            '<' | '>' => {
                let inclusive = next == Some('=');
                tokens.push(match (c, inclusive) {
                    ('<', false) => Token::Lt,
                    ('<', true) => Token::Le,
                    ('>', false) => Token::Gt,
                    _ => Token::Ge,
                });
                pos += if inclusive { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                pos += 1;
                loop {
                    match chars.get(pos) {
                        None => return Err("unterminated string".to_string()),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(pos + 1) {
                                value.push(*escaped);
                            }
                            pos += 2;
                        }
                        Some(ch) if *ch == quote => {
                            pos += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            pos += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = pos;
                pos += 1;
                while pos < chars.len()
                    && (chars[pos].is_ascii_digit()
                        || (chars[pos] == '.'
                            && chars.get(pos + 1).is_some_and(char::is_ascii_digit)))
                {
                    pos += 1;
                }
                tokens.push(Token::Number(chars[start..pos].iter().collect()));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_' || chars[pos] == '-')
                {
                    pos += 1;
                }
                tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let right = self.parse_comparison()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_unary()?;
        Ok(binary(op, left, right))
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::Number(text)) => parse_number(&text).map(Expr::Literal),
            Some(Token::Ident(name)) => {
                let literal = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = literal {
                    Ok(Expr::Literal(value))
                } else if self.peek() == Some(&Token::LParen) {
                    self.parse_call(&name)
                } else {
                    self.parse_path(name)
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, String> {
        let function = Function::from_name(name).ok_or_else(|| format!("unknown function {name}"))?;
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        if args.len() != function.arity() {
            return Err(format!(
                "{name} expects {} argument(s), got {}",
                function.arity(),
                args.len()
            ));
        }
        Ok(Expr::Call { function, args })
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, String> {
        let mut path = vec![PathSegment::Field(root)];
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(field)) => path.push(PathSegment::Field(field)),
                    Some(Token::Number(text)) => {
                        for part in text.split('.') {
                            path.push(PathSegment::Field(part.to_string()));
                        }
                    }
                    other => return Err(format!("expected field name, found {other:?}")),
                }
            } else if self.eat(&Token::LBracket) {
                match self.advance() {
                    Some(Token::Number(text)) => {
                        let index = text
                            .parse::<usize>()
                            .map_err(|_| format!("invalid index {text}"))?;
                        path.push(PathSegment::Index(index));
                    }
                    Some(Token::Str(field)) => path.push(PathSegment::Field(field)),
                    other => return Err(format!("expected index, found {other:?}")),
                }
                self.expect(&Token::RBracket)?;
            } else {
                return Ok(Expr::Path(path));
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn parse_number(text: &str) -> Result<Value, String> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::Number(int.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number {text}"))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            }
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Mismatched or missing operands compare as `false`.
fn compare(op: BinaryOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    ordering.is_some_and(|ordering| match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

fn expect_str<'a>(function: &str, value: &'a Value) -> Result<&'a str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{function} expects a string, got {value}"))
}

/// Like [`expect_str`], but `null` yields `None`.
fn optional_str<'a>(function: &str, value: &'a Value) -> Result<Option<&'a str>, String> {
    match value {
        Value::Null => Ok(None),
        other => expect_str(function, other).map(Some),
    }
}

fn affix_test(
    function: &str,
    s: &Value,
    affix: &Value,
    test: fn(&str, &str) -> bool,
) -> Result<Value, String> {
    let matched = match (optional_str(function, s)?, optional_str(function, affix)?) {
        (Some(s), Some(affix)) => test(s, affix),
        _ => false,
    };
    Ok(Value::Bool(matched))
}

fn map_str(function: &str, s: &Value, f: fn(&str) -> String) -> Result<Value, String> {
    Ok(optional_str(function, s)?.map_or(Value::Null, |s| Value::String(f(s))))
}

fn call(function: Function, args: &[Value]) -> Result<Value, String> {
    let result = match (function, args) {
        (Function::Contains, [haystack, needle]) => Value::Bool(match haystack {
            Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
            Value::Object(fields) => needle.as_str().is_some_and(|key| fields.contains_key(key)),
            Value::String(s) => optional_str("contains", needle)?.is_some_and(|n| s.contains(n)),
            Value::Null => false,
            other => return Err(format!("contains cannot search {other}")),
        }),
        (Function::StartsWith, [s, prefix]) => {
            affix_test("startsWith", s, prefix, |s, p| s.starts_with(p))?
        }
        (Function::EndsWith, [s, suffix]) => affix_test("endsWith", s, suffix, |s, p| s.ends_with(p))?,
        (Function::ToLower, [s]) => map_str("toLower", s, str::to_lowercase)?,
        (Function::ToUpper, [s]) => map_str("toUpper", s, str::to_uppercase)?,
        (Function::Trim, [s]) => map_str("trim", s, |s| s.trim().to_string())?,
        _ => return Err(format!("wrong number of arguments for {function:?}")),
    };
    Ok(result)
}

fn eval(expr: &Expr, context: &Value) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(lookup_path(context, path).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, context)?))),
        Expr::Binary { op, left, right } => {
            let left = eval(left, context)?;
            match op {
                BinaryOp::And if !truthy(&left) => Ok(Value::Bool(false)),
                BinaryOp::Or if truthy(&left) => Ok(Value::Bool(true)),
                BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(truthy(&eval(right, context)?))),
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &eval(right, context)?))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &eval(right, context)?))),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    Ok(Value::Bool(compare(*op, &left, &eval(right, context)?)))
                }
            }
        }
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|arg| eval(arg, context))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, &values)
        }
    }
}
