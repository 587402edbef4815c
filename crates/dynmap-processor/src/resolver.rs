//! Substitution resolution.
//!
//! Evaluates every substitution of a declarative mapping against the
//! normalized document and collects typed values per target path. Problems
//! with one substitution are recorded and never stop the others.

use serde_json::Value;
use tracing::debug;

use dynmap_core::diagnostics::ProcessingError;
use dynmap_core::mapping::Mapping;
use dynmap_core::path::SourcePath;
use dynmap_core::substitution::{
    RepairStrategy, ResolvedValue, SubstituteValue, Substitution, SubstitutionResult,
};

/// Resolve all substitutions of `mapping` against `document`.
pub fn resolve(mapping: &Mapping, document: &Value, log_substitution: bool) -> SubstitutionResult {
    let mut result = SubstitutionResult::new();

    for sub in &mapping.substitutions {
        let path = match SourcePath::parse(&sub.path_source) {
            Ok(path) => path,
            Err(e) => {
                result.record(ProcessingError::resolution(&sub.path_source, e.to_string()));
                continue;
            }
        };

        let extracted = if sub.expand_array {
            path.evaluate_sequence(document)
        } else {
            path.evaluate(document)
        };
        if log_substitution {
            debug!(
                mapping = %mapping.id,
                source = %sub.path_source,
                target = %sub.path_target,
                value = ?extracted,
                "Evaluated substitution"
            );
        }
        resolve_one(sub, extracted, &mut result);
    }

    result
}

fn resolve_one(sub: &Substitution, extracted: Option<Value>, result: &mut SubstitutionResult) {
    let strategy = sub.repair_strategy;
    let value = match extracted {
        None => {
            missing(sub, result);
            return;
        }
        Some(Value::Array(items)) if sub.expand_array => {
            result.mark_expanded(&sub.path_target);
            for item in items {
                push_value(sub, item, result);
            }
            return;
        }
        Some(Value::Array(items)) if strategy == RepairStrategy::UseFirstValueOfArray => {
            match items.into_iter().next() {
                Some(first) => first,
                None => return missing(sub, result),
            }
        }
        Some(Value::Array(items)) if strategy == RepairStrategy::UseLastValueOfArray => {
            match items.into_iter().next_back() {
                Some(last) => last,
                None => return missing(sub, result),
            }
        }
        Some(value) => value,
    };
    push_value(sub, value, result);
}

fn push_value(sub: &Substitution, value: Value, result: &mut SubstitutionResult) {
    if value.is_null() && sub.repair_strategy == RepairStrategy::RemoveIfNull {
        result.push(&sub.path_target, ResolvedValue::new(SubstituteValue::Ignore, sub));
        return;
    }
    match SubstituteValue::coerce(value, sub.declared_type) {
        Ok(Some(typed)) => result.push(&sub.path_target, ResolvedValue::new(typed, sub)),
        Ok(None) => {}
        Err(reason) => result.record(ProcessingError::resolution(&sub.path_source, reason)),
    }
}

/// The source path yielded nothing.
fn missing(sub: &Substitution, result: &mut SubstitutionResult) {
    match sub.repair_strategy {
        RepairStrategy::RemoveIfMissing | RepairStrategy::RemoveIfNull => {
            result.push(&sub.path_target, ResolvedValue::new(SubstituteValue::Ignore, sub));
        }
        RepairStrategy::Ignore => {}
        _ => result.record(ProcessingError::resolution(
            &sub.path_source,
            "source path not found",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynmap_core::mapping::TargetApi;
    use dynmap_core::substitution::SubstitutionType;
    use serde_json::json;

    fn mapping(subs: Vec<Substitution>) -> Mapping {
        let mut mapping = Mapping::new("m", "t/+", TargetApi::Measurement);
        mapping.substitutions = subs;
        mapping
    }

    #[test]
    fn test_scalar_and_expanded() {
        let doc = json!({"t": 21.5, "values": [1, 2, 3]});
        let result = resolve(
            &mapping(vec![
                Substitution::new("t", "c8y_T.T.value"),
                Substitution::new("values", "c8y_V.V.value").expanded(),
                Substitution::new("values", "all"),
            ]),
            &doc,
            false,
        );

        assert!(result.errors().is_empty());
        assert_eq!(result.get("c8y_T.T.value").unwrap().len(), 1);
        let expanded: Vec<_> = result
            .get("c8y_V.V.value")
            .unwrap()
            .iter()
            .map(|v| v.value.to_json().unwrap())
            .collect();
        assert_eq!(expanded, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(
            result.get("all").unwrap()[0].value,
            SubstituteValue::Object(json!([1, 2, 3]))
        );
    }

    #[test]
    fn test_expansion_marks_only_array_sources() {
        let doc = json!({"rows": [], "one": 7});
        let result = resolve(
            &mapping(vec![
                Substitution::new("rows", "c8y_V.V.value").expanded(),
                Substitution::new("one", "single").expanded(),
            ]),
            &doc,
            false,
        );

        assert!(result.get("c8y_V.V.value").is_none());
        assert!(result.is_expanded("c8y_V.V.value"));
        assert!(!result.is_expanded("single"));
        assert_eq!(result.fan_out_lengths()["c8y_V.V.value"], 0);
    }

    #[test]
    fn test_first_and_last_value() {
        let doc = json!({"values": [1, 2, 3], "empty": []});
        let result = resolve(
            &mapping(vec![
                Substitution::new("values", "first").with_repair(RepairStrategy::UseFirstValueOfArray),
                Substitution::new("values", "last").with_repair(RepairStrategy::UseLastValueOfArray),
                Substitution::new("empty", "none").with_repair(RepairStrategy::UseFirstValueOfArray),
            ]),
            &doc,
            false,
        );
        assert_eq!(result.get("first").unwrap()[0].value.to_json(), Some(json!(1)));
        assert_eq!(result.get("last").unwrap()[0].value.to_json(), Some(json!(3)));
        assert!(result.get("none").is_none());
        assert_eq!(result.errors().len(), 1);
    }

    #[test]
    fn test_missing_paths() {
        let doc = json!({"present": null});
        let result = resolve(
            &mapping(vec![
                Substitution::new("gone", "a"),
                Substitution::new("gone", "b").with_repair(RepairStrategy::RemoveIfMissing),
                Substitution::new("present", "c").with_repair(RepairStrategy::RemoveIfNull),
                Substitution::new("gone", "d").with_repair(RepairStrategy::Ignore),
                Substitution::new("present", "e").with_repair(RepairStrategy::RemoveIfMissing),
            ]),
            &doc,
            false,
        );

        assert!(result.get("a").is_none());
        assert!(result.get("b").unwrap()[0].value.is_ignore());
        assert!(result.get("c").unwrap()[0].value.is_ignore());
        assert!(result.get("d").is_none());
        assert_eq!(result.get("e").unwrap()[0].value, SubstituteValue::Object(Value::Null));
        assert_eq!(result.errors().len(), 1);
    }

    #[test]
    fn test_declared_types() {
        let doc = json!({"n": "+021.63", "bad": "warm", "flag": true});
        let result = resolve(
            &mapping(vec![
                Substitution::new("n", "n").with_type(SubstitutionType::Number),
                Substitution::new("bad", "bad").with_type(SubstitutionType::Number),
                Substitution::new("flag", "flag").with_type(SubstitutionType::Textual),
                Substitution::new("flag", "skipped").with_type(SubstitutionType::Ignore),
            ]),
            &doc,
            false,
        );

        assert_eq!(result.get("n").unwrap()[0].value.to_json(), Some(json!(21.63)));
        assert!(result.get("bad").is_none());
        assert_eq!(result.get("flag").unwrap()[0].value, SubstituteValue::Text("true".to_string()));
        assert!(result.get("skipped").is_none());
        assert_eq!(result.errors().len(), 1);
        assert!(matches!(result.errors()[0], ProcessingError::Resolution { .. }));
    }

    #[test]
    fn test_invalid_source_path_does_not_stop_others() {
        let doc = json!({"a": 1});
        let result = resolve(
            &mapping(vec![Substitution::new("a[", "x"), Substitution::new("a", "y")]),
            &doc,
            false,
        );
        assert_eq!(result.errors().len(), 1);
        assert!(result.get("y").is_some());
    }
}
