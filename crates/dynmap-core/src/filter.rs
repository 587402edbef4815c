//! Mapping filters.
//!
//! A filter decides whether a normalized message is processed by a mapping
//! at all. It is either a bare path, which passes when the value is truthy,
//! or a comparison of a path against a literal:
//!
//! ```text
//! status = 'ACTIVE'
//! temperature > 100
//! meta.`device.kind` != "gateway"
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::path::{number_from_str, to_text, SourcePath};

/// Comparison operators understood in filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "=",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            ComparisonOperator::Equal => ordering == Ordering::Equal,
            ComparisonOperator::NotEqual => ordering != Ordering::Equal,
            ComparisonOperator::GreaterThan => ordering == Ordering::Greater,
            ComparisonOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            ComparisonOperator::LessThan => ordering == Ordering::Less,
            ComparisonOperator::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

// Longest operators first so `>=` is not read as `>`.
const OPERATORS: [(&str, ComparisonOperator); 7] = [
    ("!=", ComparisonOperator::NotEqual),
    (">=", ComparisonOperator::GreaterThanOrEqual),
    ("<=", ComparisonOperator::LessThanOrEqual),
    ("==", ComparisonOperator::Equal),
    ("=", ComparisonOperator::Equal),
    (">", ComparisonOperator::GreaterThan),
    ("<", ComparisonOperator::LessThan),
];

/// A parsed `filterMapping` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    raw: String,
    path: SourcePath,
    comparison: Option<(ComparisonOperator, Value)>,
}

impl Filter {
    pub fn parse(expr: &str) -> Result<Self> {
        let raw = expr.trim();
        if raw.is_empty() {
            return Err(Error::InvalidPath {
                path: expr.to_string(),
                reason: "empty filter".to_string(),
            });
        }

        let Some((at, op_text, op)) = find_operator(raw) else {
            return Ok(Self {
                raw: raw.to_string(),
                path: SourcePath::parse(raw)?,
                comparison: None,
            });
        };

        let left = raw[..at].trim();
        let right = raw[at + op_text.len()..].trim();
        if left.is_empty() || right.is_empty() {
            return Err(Error::InvalidPath {
                path: raw.to_string(),
                reason: format!("'{}' needs a path and a literal", op_text),
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            path: SourcePath::parse(left)?,
            comparison: Some((op, literal(right))),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `doc` passes the filter. A missing path never passes.
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(value) = self.path.evaluate(doc) else {
            return false;
        };
        match &self.comparison {
            None => is_truthy(&value),
            Some((op, expected)) => match compare(&value, expected) {
                Some(ordering) => op.accepts(ordering),
                None => *op == ComparisonOperator::NotEqual,
            },
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Locate the first operator outside quotes and backticks.
fn find_operator(expr: &str) -> Option<(usize, &'static str, ComparisonOperator)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None => {
                let rest = &expr[i..];
                if let Some((text, op)) = OPERATORS.iter().find(|(text, _)| rest.starts_with(text)) {
                    return Some((i, text, *op));
                }
            }
        }
    }
    None
}

fn literal(text: &str) -> Value {
    for q in ['\'', '"'] {
        if let Some(inner) = text.strip_prefix(q).and_then(|t| t.strip_suffix(q)) {
            return Value::String(inner.to_string());
        }
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => number_from_str(text)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => number_from_str(s).and_then(|n| n.as_f64()),
        _ => None,
    }
}

/// Numbers compare numerically (numeric strings included), everything else
/// by equality of its text form.
fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_f64(actual), as_f64(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) if to_text(a) == to_text(b) => Some(Ordering::Equal),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
        Value::Null => false,
    }
}
