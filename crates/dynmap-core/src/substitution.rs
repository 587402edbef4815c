//! Substitutions, typed substitute values and the per-message result map.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::diagnostics::ProcessingError;
use crate::path::{number_from_str, to_text};

/// Reserved names that address routing metadata instead of document fields.
pub mod tokens {
    pub const TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";
    pub const CONTEXT_DATA: &str = "_CONTEXT_DATA_";
    pub const IDENTITY: &str = "_IDENTITY_";
    pub const EXTERNAL_ID: &str = "externalId";
    pub const SOURCE_ID: &str = "c8ySourceId";

    pub const CTX_API: &str = "api";
    pub const CTX_METHOD: &str = "method";
    pub const CTX_PUBLISH_TOPIC: &str = "publishTopic";
    pub const CTX_DEVICE_NAME: &str = "deviceName";
    pub const CTX_DEVICE_TYPE: &str = "deviceType";
    pub const CTX_PROCESSING_MODE: &str = "processingMode";
    pub const CTX_RETAIN: &str = "retain";
    pub const CTX_KEY: &str = "key";
    pub const CTX_ATTACHMENT_PREFIX: &str = "attachment_";
}

/// How a resolved value is written into the target document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    /// Write when the parent container exists, otherwise drop the value.
    #[default]
    Default,
    /// Build missing intermediate objects and arrays.
    CreateIfMissing,
    /// Remove the target when the source path was missing.
    RemoveIfMissing,
    /// Remove the target when the source was missing or null.
    RemoveIfNull,
    /// Keep the skeleton value when the source was missing.
    Ignore,
    /// Collapse a collection to its first element.
    UseFirstValueOfArray,
    /// Collapse a collection to its last element.
    UseLastValueOfArray,
}

/// Declared type of a substitution value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubstitutionType {
    Textual,
    Number,
    Object,
    Ignore,
}

/// One source-to-target rule of a declarative mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    pub path_source: String,
    pub path_target: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<SubstitutionType>,
    #[serde(default)]
    pub repair_strategy: RepairStrategy,
    #[serde(default)]
    pub expand_array: bool,
}

impl Substitution {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path_source: source.into(),
            path_target: target.into(),
            declared_type: None,
            repair_strategy: RepairStrategy::Default,
            expand_array: false,
        }
    }

    pub fn with_repair(mut self, strategy: RepairStrategy) -> Self {
        self.repair_strategy = strategy;
        self
    }

    pub fn with_type(mut self, declared: SubstitutionType) -> Self {
        self.declared_type = Some(declared);
        self
    }

    pub fn expanded(mut self) -> Self {
        self.expand_array = true;
        self
    }
}

/// What a target path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind<'a> {
    /// `_IDENTITY_.externalId`
    ExternalId,
    /// `_IDENTITY_.c8ySourceId`
    SourceId,
    /// `_CONTEXT_DATA_.<key>`
    ContextData(&'a str),
    /// `_TOPIC_LEVEL_[n]`
    TopicLevel(usize),
    /// Anything else lands in the document body.
    Body(&'a str),
}

impl<'a> TargetKind<'a> {
    pub fn classify(target: &'a str) -> Self {
        let target = target.trim();
        let bare = target.strip_prefix("$.").unwrap_or(target);

        if let Some(field) = bare
            .strip_prefix(tokens::IDENTITY)
            .and_then(|rest| rest.strip_prefix('.'))
        {
            match field {
                tokens::EXTERNAL_ID => return Self::ExternalId,
                tokens::SOURCE_ID => return Self::SourceId,
                _ => {}
            }
        }
        if let Some(key) = bare
            .strip_prefix(tokens::CONTEXT_DATA)
            .and_then(|rest| rest.strip_prefix('.'))
        {
            return Self::ContextData(key);
        }
        if let Some(index) = bare
            .strip_prefix(tokens::TOPIC_LEVEL)
            .and_then(|rest| rest.strip_prefix('['))
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|n| n.trim().parse().ok())
        {
            return Self::TopicLevel(index);
        }
        Self::Body(target)
    }

    /// Identity, context data and topic level targets are routing metadata.
    pub fn is_virtual(&self) -> bool {
        !matches!(self, Self::Body(_))
    }
}

/// A typed value produced by evaluating a source path.
#[derive(Debug, Clone, PartialEq)]
pub enum SubstituteValue {
    Text(String),
    Number(Number),
    Boolean(bool),
    Object(Value),
    /// The source was missing or null and the target should be removed.
    Ignore,
}

impl SubstituteValue {
    /// Infer the variant from a JSON value.
    pub fn infer(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s),
            Value::Number(n) => Self::Number(n),
            Value::Bool(b) => Self::Boolean(b),
            other => Self::Object(other),
        }
    }

    /// Apply a declared type. `Ok(None)` means the substitution is skipped.
    pub fn coerce(value: Value, declared: Option<SubstitutionType>) -> Result<Option<Self>, String> {
        match declared {
            None => Ok(Some(Self::infer(value))),
            Some(SubstitutionType::Ignore) => Ok(None),
            Some(SubstitutionType::Object) => Ok(Some(Self::Object(value))),
            Some(SubstitutionType::Textual) => Ok(Some(Self::Text(to_text(&value)))),
            Some(SubstitutionType::Number) => match &value {
                Value::Number(n) => Ok(Some(Self::Number(n.clone()))),
                Value::String(s) => number_from_str(s)
                    .map(|n| Some(Self::Number(n)))
                    .ok_or_else(|| format!("'{}' is not a number", s)),
                Value::Bool(b) => Ok(Some(Self::Number(Number::from(u8::from(*b))))),
                other => Err(format!("{} is not a number", other)),
            },
        }
    }

    /// JSON form of the value; `None` for [`SubstituteValue::Ignore`].
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Self::Text(s) => Some(Value::String(s.clone())),
            Self::Number(n) => Some(Value::Number(n.clone())),
            Self::Boolean(b) => Some(Value::Bool(*b)),
            Self::Object(v) => Some(v.clone()),
            Self::Ignore => None,
        }
    }

    /// Text form used for identifiers and routing metadata.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::Object(Value::Null) | Self::Ignore => None,
            Self::Object(v) => Some(to_text(v)),
        }
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignore)
    }
}

/// A substitute value with the rule that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub value: SubstituteValue,
    pub repair_strategy: RepairStrategy,
    pub expand_array: bool,
}

impl ResolvedValue {
    pub fn new(value: SubstituteValue, substitution: &Substitution) -> Self {
        Self {
            value,
            repair_strategy: substitution.repair_strategy,
            expand_array: substitution.expand_array,
        }
    }
}

/// Resolved values keyed by target path, built once per message.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionResult {
    values: BTreeMap<String, Vec<ResolvedValue>>,
    expanded: BTreeSet<String>,
    errors: Vec<ProcessingError>,
}

impl SubstitutionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: &str, value: ResolvedValue) {
        self.values
            .entry(target.trim().to_string())
            .or_default()
            .push(value);
    }

    /// Mark `target` as fed by an expanded array, even an empty one.
    pub fn mark_expanded(&mut self, target: &str) {
        self.expanded.insert(target.trim().to_string());
    }

    pub fn is_expanded(&self, target: &str) -> bool {
        self.expanded.contains(target)
    }

    pub fn record(&mut self, error: ProcessingError) {
        self.errors.push(error);
    }

    pub fn get(&self, target: &str) -> Option<&[ResolvedValue]> {
        self.values.get(target).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ResolvedValue])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn errors(&self) -> &[ProcessingError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<ProcessingError> {
        std::mem::take(&mut self.errors)
    }

    /// Number of values behind every expanded target. Empty when nothing
    /// was expanded; a zero entry means an expanded array had no elements.
    pub fn fan_out_lengths(&self) -> BTreeMap<String, usize> {
        self.expanded
            .iter()
            .map(|k| (k.clone(), self.values.get(k).map_or(0, Vec::len)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitution_json_shape() {
        let sub: Substitution = serde_json::from_value(json!({
            "pathSource": "temperature",
            "pathTarget": "c8y_TemperatureMeasurement.T.value",
            "repairStrategy": "CREATE_IF_MISSING",
            "expandArray": false
        }))
        .unwrap();
        assert_eq!(sub.repair_strategy, RepairStrategy::CreateIfMissing);
        assert_eq!(sub.declared_type, None);

        let typed: Substitution = serde_json::from_value(json!({
            "pathSource": "a",
            "pathTarget": "b",
            "type": "NUMBER"
        }))
        .unwrap();
        assert_eq!(typed.declared_type, Some(SubstitutionType::Number));
        assert_eq!(typed.repair_strategy, RepairStrategy::Default);
    }

    #[test]
    fn test_classify_targets() {
        assert_eq!(
            TargetKind::classify("_IDENTITY_.externalId"),
            TargetKind::ExternalId
        );
        assert_eq!(
            TargetKind::classify("$._IDENTITY_.c8ySourceId"),
            TargetKind::SourceId
        );
        assert_eq!(
            TargetKind::classify("_CONTEXT_DATA_.deviceName"),
            TargetKind::ContextData("deviceName")
        );
        assert_eq!(
            TargetKind::classify("_TOPIC_LEVEL_[2]"),
            TargetKind::TopicLevel(2)
        );
        assert_eq!(TargetKind::classify("a.b"), TargetKind::Body("a.b"));
        assert!(!TargetKind::classify("_IDENTITY_.other").is_virtual());
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            SubstituteValue::coerce(json!("+021.63"), Some(SubstitutionType::Number)),
            Ok(Some(SubstituteValue::Number(Number::from_f64(21.63).unwrap())))
        );
        assert!(SubstituteValue::coerce(json!("abc"), Some(SubstitutionType::Number)).is_err());
        assert_eq!(
            SubstituteValue::coerce(json!(12), Some(SubstitutionType::Textual)),
            Ok(Some(SubstituteValue::Text("12".into())))
        );
        assert_eq!(
            SubstituteValue::coerce(json!({"a": 1}), Some(SubstitutionType::Ignore)),
            Ok(None)
        );
        assert_eq!(
            SubstituteValue::coerce(json!("x"), Some(SubstitutionType::Object)),
            Ok(Some(SubstituteValue::Object(json!("x"))))
        );
        assert_eq!(
            SubstituteValue::coerce(json!(true), None),
            Ok(Some(SubstituteValue::Boolean(true)))
        );
    }

    #[test]
    fn test_as_text() {
        assert_eq!(SubstituteValue::Number(Number::from(42)).as_text().as_deref(), Some("42"));
        assert_eq!(SubstituteValue::Object(Value::Null).as_text(), None);
        assert_eq!(SubstituteValue::Ignore.as_text(), None);
    }

    #[test]
    fn test_fan_out_lengths() {
        let sub = Substitution::new("a", "x").expanded();
        let mut result = SubstitutionResult::new();
        result.mark_expanded("x");
        for i in 0..3 {
            result.push("x", ResolvedValue::new(SubstituteValue::Number(i.into()), &sub));
        }
        result.push("y", ResolvedValue::new(SubstituteValue::Boolean(true), &sub));
        result.mark_expanded("z");

        let lengths = result.fan_out_lengths();
        assert_eq!(lengths.len(), 2);
        assert_eq!(lengths["x"], 3);
        assert_eq!(lengths["z"], 0);
        assert!(!result.is_expanded("y"));
    }

    #[test]
    fn test_repeated_plain_target_is_not_fan_out() {
        let sub = Substitution::new("a", "x");
        let mut result = SubstitutionResult::new();
        result.push("x", ResolvedValue::new(SubstituteValue::Number(1.into()), &sub));
        result.push("x", ResolvedValue::new(SubstituteValue::Number(2.into()), &sub));
        assert!(result.fan_out_lengths().is_empty());
    }
}
