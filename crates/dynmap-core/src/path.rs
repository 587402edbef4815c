//! Path language for substitutions.
//!
//! Source paths are a small JSONata subset:
//!
//! - `$` is the document root, `$.a.b` and `a.b` walk object fields
//! - `a[0]`, `a[-1]` index arrays (negative indexes count from the end)
//! - `a[*]` expands an array into a sequence
//! - `` `odd.name` `` quotes a field name containing separators
//! - a field step applied to an array maps over its elements and flattens
//!   the results, so `rows.temp` yields every `temp` value
//! - `$number(p)`, `$string(p)`, `$count(p)` and `$exists(p)` wrap a path
//!
//! Target paths are plain `a.b[0].c` locations used for writes.

use std::fmt;

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// One step of a source path.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(String),
    Index(i64),
    Wildcard,
}

/// Functions that can wrap a source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFunction {
    Number,
    String,
    Count,
    Exists,
}

impl PathFunction {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "count" => Some(Self::Count),
            "exists" => Some(Self::Exists),
            _ => None,
        }
    }
}

/// A parsed source path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePath {
    Path(Vec<Step>),
    Call(PathFunction, Box<SourcePath>),
}

impl SourcePath {
    /// Parse a source expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parser = Parser::new(expr);
        let path = parser.expression()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(path)
    }

    /// Evaluate against a document. `None` means the path did not match.
    pub fn evaluate(&self, doc: &Value) -> Option<Value> {
        match self {
            Self::Path(steps) => walk(steps, doc),
            Self::Call(func, inner) => {
                let value = inner.evaluate(doc);
                apply_function(*func, value)
            }
        }
    }

    /// Evaluate for array expansion. A sequence produced by implicit mapping
    /// stays an array even with one element, and a path running through an
    /// empty array yields an empty array instead of nothing.
    pub fn evaluate_sequence(&self, doc: &Value) -> Option<Value> {
        let Self::Path(steps) = self else {
            return self.evaluate(doc);
        };
        if let Some((values, sequence)) = select(steps, doc) {
            return Some(match values.as_slice() {
                [single] if !sequence => (*single).clone(),
                many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
            });
        }
        let through_empty = (1..steps.len()).any(|n| {
            matches!(select(&steps[..n], doc), Some((values, _))
                if matches!(values.as_slice(), [Value::Array(items)] if items.is_empty()))
        });
        through_empty.then(|| Value::Array(Vec::new()))
    }

    /// Steps of a plain path, `None` for function calls.
    pub fn steps(&self) -> Option<&[Step]> {
        match self {
            Self::Path(steps) => Some(steps),
            Self::Call(..) => None,
        }
    }
}

fn walk(steps: &[Step], doc: &Value) -> Option<Value> {
    let (current, sequence) = select(steps, doc)?;
    match current.as_slice() {
        [] => None,
        [single] => Some((*single).clone()),
        many if sequence => Some(Value::Array(many.iter().map(|v| (*v).clone()).collect())),
        many => Some(many[0].clone()),
    }
}

/// Values matched by `steps`, and whether they form a mapped sequence.
fn select<'a>(steps: &[Step], doc: &'a Value) -> Option<(Vec<&'a Value>, bool)> {
    let mut current: Vec<&Value> = vec![doc];
    let mut sequence = false;

    for step in steps {
        let mut next: Vec<&Value> = Vec::new();
        match step {
            Step::Field(name) => {
                let mapped = sequence || current.iter().any(|v| v.is_array());
                for item in current.iter().copied() {
                    collect_field(item, name, mapped, &mut next);
                }
                sequence = mapped;
            }
            Step::Index(index) => {
                let first: &Value = current[0];
                let target: Vec<&Value> = match first {
                    Value::Array(items) if !sequence && current.len() == 1 => {
                        items.iter().collect()
                    }
                    _ => current.clone(),
                };
                if let Some(pos) = resolve_index(*index, target.len()) {
                    next.push(target[pos]);
                }
                sequence = false;
            }
            Step::Wildcard => {
                for item in current.iter().copied() {
                    match item {
                        Value::Array(items) => next.extend(items.iter()),
                        other => next.push(other),
                    }
                }
                sequence = true;
            }
        }
        if next.is_empty() {
            return None;
        }
        current = next;
    }

    Some((current, sequence))
}

fn collect_field<'a>(item: &'a Value, name: &str, flatten: bool, out: &mut Vec<&'a Value>) {
    match item {
        Value::Object(map) => {
            if let Some(value) = map.get(name) {
                match value {
                    Value::Array(items) if flatten => out.extend(items.iter()),
                    other => out.push(other),
                }
            }
        }
        Value::Array(items) => {
            for element in items {
                collect_field(element, name, true, out);
            }
        }
        _ => {}
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let pos = if index < 0 { len + index } else { index };
    (0..len).contains(&pos).then_some(pos as usize)
}

fn apply_function(func: PathFunction, value: Option<Value>) -> Option<Value> {
    match func {
        PathFunction::Exists => Some(Value::Bool(value.is_some())),
        PathFunction::Count => {
            let count = match &value {
                None => 0,
                Some(Value::Array(items)) => items.len(),
                Some(_) => 1,
            };
            Some(Value::from(count))
        }
        PathFunction::Number => match value? {
            Value::Array(items) => {
                let numbers: Vec<Value> = items
                    .into_iter()
                    .filter_map(|v| to_number(&v).map(Value::Number))
                    .collect();
                (!numbers.is_empty()).then_some(Value::Array(numbers))
            }
            other => to_number(&other).map(Value::Number),
        },
        PathFunction::String => {
            let value = value?;
            Some(Value::String(to_text(&value)))
        }
    }
}

/// Parse a number the way device payloads write them (`+021.63`, `-088.7`).
pub fn number_from_str(text: &str) -> Option<Number> {
    let trimmed = text.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.is_empty() {
        return None;
    }
    if let Ok(i) = unsigned.parse::<i64>() {
        return Some(Number::from(i));
    }
    unsigned
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

fn to_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => number_from_str(s),
        Value::Bool(b) => Some(Number::from(u8::from(*b))),
        _ => None,
    }
}

/// Render a value as text; strings are not quoted.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> Error {
        Error::InvalidPath {
            path: self.input.to_string(),
            reason: format!("{} at position {}", reason, self.pos),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn expression(&mut self) -> Result<SourcePath> {
        self.skip_ws();
        if self.at_end() {
            return Err(self.error("empty path"));
        }

        if self.peek() == Some('$') {
            let start = self.pos;
            self.pos += 1;
            let name = self.identifier();
            self.skip_ws();
            if !name.is_empty() && self.peek() == Some('(') {
                let func = PathFunction::from_name(&name)
                    .ok_or_else(|| self.error(&format!("unknown function ${}", name)))?;
                self.pos += 1;
                let inner = self.expression()?;
                self.expect(')')?;
                return Ok(SourcePath::Call(func, Box::new(inner)));
            }
            if !name.is_empty() {
                // `$foo` without a call is a plain field named `$foo`
                self.pos = start;
            } else {
                return self.steps_after_root();
            }
        }

        let mut steps = vec![self.field()?];
        self.rest(&mut steps)?;
        Ok(SourcePath::Path(steps))
    }

    fn steps_after_root(&mut self) -> Result<SourcePath> {
        let mut steps = Vec::new();
        self.rest(&mut steps)?;
        Ok(SourcePath::Path(steps))
    }

    fn rest(&mut self, steps: &mut Vec<Step>) -> Result<()> {
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    steps.push(self.field()?);
                }
                Some('[') => {
                    self.pos += 1;
                    steps.push(self.bracket()?);
                }
                _ => return Ok(()),
            }
        }
    }

    fn field(&mut self) -> Result<Step> {
        if self.peek() == Some('`') {
            self.pos += 1;
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '`') {
                self.pos += 1;
            }
            if self.at_end() {
                return Err(self.error("unterminated quoted name"));
            }
            let name: String = self.chars[start..self.pos].iter().collect();
            self.pos += 1;
            return Ok(Step::Field(name));
        }
        if self.peek() == Some('*') {
            self.pos += 1;
            return Ok(Step::Wildcard);
        }
        let name = self.identifier();
        if name.is_empty() {
            return Err(self.error("expected field name"));
        }
        Ok(Step::Field(name))
    }

    fn bracket(&mut self) -> Result<Step> {
        self.skip_ws();
        let step = if self.peek() == Some('*') {
            self.pos += 1;
            Step::Wildcard
        } else {
            let start = self.pos;
            if self.peek() == Some('-') {
                self.pos += 1;
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
            let digits: String = self.chars[start..self.pos].iter().collect();
            let index = digits
                .parse::<i64>()
                .map_err(|_| self.error("expected array index"))?;
            Step::Index(index)
        };
        self.expect(']')?;
        Ok(step)
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !matches!(c, '.' | '[' | ']' | '(' | ')' | '`') && !c.is_whitespace())
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

/// One segment of a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSegment {
    Key(String),
    Index(usize),
}

impl TargetSegment {
    fn empty_container(&self) -> Value {
        match self {
            Self::Key(_) => Value::Object(Map::new()),
            Self::Index(_) => Value::Array(Vec::new()),
        }
    }
}

/// A writable location inside a target document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    raw: String,
    segments: Vec<TargetSegment>,
}

impl TargetPath {
    /// Parse `a.b[0].c`, `$.a` or `$` (the document root).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidPath {
                path: raw.to_string(),
                reason: "empty target".to_string(),
            });
        }
        let steps = match SourcePath::parse(trimmed)? {
            SourcePath::Path(steps) => steps,
            SourcePath::Call(..) => {
                return Err(Error::InvalidPath {
                    path: raw.to_string(),
                    reason: "functions are not allowed in targets".to_string(),
                })
            }
        };

        let segments = steps
            .into_iter()
            .map(|step| match step {
                Step::Field(name) => Ok(TargetSegment::Key(name)),
                Step::Index(i) if i >= 0 => Ok(TargetSegment::Index(i as usize)),
                other => Err(Error::InvalidPath {
                    path: raw.to_string(),
                    reason: format!("{:?} cannot be written to", other),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[TargetSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get<'v>(&self, doc: &'v Value) -> Option<&'v Value> {
        self.segments.iter().try_fold(doc, |cur, seg| match (seg, cur) {
            (TargetSegment::Key(k), Value::Object(map)) => map.get(k),
            (TargetSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        })
    }

    /// Whether the container the last segment writes into already exists.
    pub fn parent_exists(&self, doc: &Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            return true;
        };
        let parent = parents.iter().try_fold(doc, |cur, seg| match (seg, cur) {
            (TargetSegment::Key(k), Value::Object(map)) => map.get(k),
            (TargetSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        });
        match (last, parent) {
            (TargetSegment::Key(_), Some(Value::Object(_))) => true,
            (TargetSegment::Index(i), Some(Value::Array(items))) => *i <= items.len(),
            _ => false,
        }
    }

    /// Write `value`. With `create` missing intermediate containers are
    /// built; without it the write fails unless the parent exists.
    /// Writing to the root merges object fields into the document.
    pub fn set(&self, doc: &mut Value, value: Value, create: bool) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            match (doc, value) {
                (Value::Object(target), Value::Object(fields)) => target.extend(fields),
                (doc, value) => *doc = value,
            }
            return true;
        };

        let mut cur = doc;
        for seg in parents {
            cur = match child_mut(cur, seg, create) {
                Some(child) => child,
                None => return false,
            };
        }

        if create && cur.is_null() {
            *cur = last.empty_container();
        }
        match (last, cur) {
            (TargetSegment::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), value);
                true
            }
            (TargetSegment::Index(i), Value::Array(items)) => {
                if *i < items.len() {
                    items[*i] = value;
                } else if *i == items.len() || create {
                    items.resize(*i, Value::Null);
                    items.push(value);
                } else {
                    return false;
                }
                true
            }
            _ => false,
        }
    }

    /// Remove the value at this location. Returns whether anything was removed.
    pub fn remove(&self, doc: &mut Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            return false;
        };
        let mut cur = doc;
        for seg in parents {
            cur = match child_mut(cur, seg, false) {
                Some(child) => child,
                None => return false,
            };
        }
        match (last, cur) {
            (TargetSegment::Key(k), Value::Object(map)) => map.remove(k).is_some(),
            (TargetSegment::Index(i), Value::Array(items)) if *i < items.len() => {
                items.remove(*i);
                true
            }
            _ => false,
        }
    }
}

fn child_mut<'v>(cur: &'v mut Value, seg: &TargetSegment, create: bool) -> Option<&'v mut Value> {
    if create && cur.is_null() {
        *cur = seg.empty_container();
    }
    match (seg, cur) {
        (TargetSegment::Key(k), Value::Object(map)) => {
            if create {
                Some(map.entry(k.clone()).or_insert(Value::Null))
            } else {
                map.get_mut(k)
            }
        }
        (TargetSegment::Index(i), Value::Array(items)) => {
            if *i >= items.len() {
                if !create {
                    return None;
                }
                items.resize(*i + 1, Value::Null);
            }
            items.get_mut(*i)
        }
        _ => None,
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
