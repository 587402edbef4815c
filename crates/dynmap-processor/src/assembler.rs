//! Document assembly.
//!
//! Merges a [`SubstitutionResult`] into copies of the mapping's skeleton.
//! Targets fed by an expanded array fan out: document `i` takes element `i`
//! of every expanded target, all other targets are written into every
//! document. Identity, context data and topic level targets become routing
//! metadata of the produced action instead of body fields.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use dynmap_core::action::{
    ActionKind, CumulocityObject, DeviceMessage, DomainAction, ExternalSource, HttpMethod,
};
use dynmap_core::diagnostics::ProcessingError;
use dynmap_core::mapping::{Mapping, TargetApi};
use dynmap_core::path::TargetPath;
use dynmap_core::substitution::{
    tokens, RepairStrategy, ResolvedValue, SubstitutionResult, TargetKind,
};
use dynmap_core::topic;

/// Actions built from one message, with local problems.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub actions: Vec<DomainAction>,
    pub errors: Vec<ProcessingError>,
}

/// Routing metadata collected for one document.
#[derive(Debug, Default)]
struct Routing {
    external_id: Option<String>,
    source_id: Option<String>,
    context: BTreeMap<String, String>,
    topic_levels: BTreeMap<usize, String>,
}

/// Build the domain actions for `result`.
pub fn assemble(
    result: &SubstitutionResult,
    mapping: &Mapping,
    skeleton: &Value,
    received_at: DateTime<Utc>,
) -> Assembly {
    let mut assembly = Assembly::default();

    let lengths = result.fan_out_lengths();
    // an expanded array without elements produces no documents at all
    let count = if lengths.is_empty() {
        1
    } else {
        lengths.values().copied().min().unwrap_or(0)
    };
    if lengths.values().any(|len| *len != count) {
        assembly.errors.push(ProcessingError::FanOutMismatch {
            lengths: lengths.clone(),
            used: count,
        });
    }

    for index in 0..count {
        let mut doc = skeleton.clone();
        let mut routing = Routing::default();

        for (target, values) in result.iter() {
            let resolved = if result.is_expanded(target) {
                values.get(index)
            } else {
                values.last()
            };
            let Some(resolved) = resolved else {
                continue;
            };
            match TargetKind::classify(target) {
                TargetKind::ExternalId => routing.external_id = resolved.value.as_text(),
                TargetKind::SourceId => routing.source_id = resolved.value.as_text(),
                TargetKind::ContextData(key) => {
                    if let Some(text) = resolved.value.as_text() {
                        routing.context.insert(key.to_string(), text);
                    }
                }
                TargetKind::TopicLevel(level) => {
                    if let Some(text) = resolved.value.as_text() {
                        routing.topic_levels.insert(level, text);
                    }
                }
                TargetKind::Body(path) => write_body(&mut doc, path, resolved, &mut assembly.errors),
            }
        }

        let action = if mapping.is_inbound() {
            platform_object(doc, routing, mapping, received_at, &mut assembly.errors)
        } else {
            device_message(doc, routing, mapping)
        };
        assembly.actions.push(action);
    }

    assembly
}

fn write_body(doc: &mut Value, target: &str, resolved: &ResolvedValue, errors: &mut Vec<ProcessingError>) {
    let path = match TargetPath::parse(target) {
        Ok(path) => path,
        Err(e) => {
            errors.push(ProcessingError::repair(target, e.to_string()));
            return;
        }
    };

    let Some(value) = resolved.value.to_json() else {
        path.remove(doc);
        return;
    };
    let create = resolved.repair_strategy == RepairStrategy::CreateIfMissing;
    if !path.set(doc, value, create) {
        let reason = if create {
            "target cannot be created"
        } else {
            "parent of target does not exist"
        };
        errors.push(ProcessingError::repair(target, reason));
    }
}

fn action_from_method(method: Option<&String>) -> Option<ActionKind> {
    match method?.parse::<HttpMethod>().ok()? {
        HttpMethod::Post => Some(ActionKind::Create),
        HttpMethod::Put => Some(ActionKind::Update),
        HttpMethod::Patch => Some(ActionKind::Patch),
        HttpMethod::Delete => Some(ActionKind::Delete),
        HttpMethod::Get => None,
    }
}

fn platform_object(
    mut doc: Value,
    routing: Routing,
    mapping: &Mapping,
    received_at: DateTime<Utc>,
    errors: &mut Vec<ProcessingError>,
) -> DomainAction {
    let api = match routing.context.get(tokens::CTX_API) {
        Some(name) => TargetApi::from_name(name).unwrap_or_else(|| {
            errors.push(ProcessingError::resolution(
                format!("{}.{}", tokens::CONTEXT_DATA, tokens::CTX_API),
                format!("unknown API '{}'", name),
            ));
            mapping.target_api
        }),
        None => mapping.target_api,
    };

    if let Some(source_id) = &routing.source_id {
        if let Ok(path) = TargetPath::parse(api.identifier_path()) {
            path.set(&mut doc, Value::String(source_id.clone()), true);
        }
    }

    if api.is_timed() {
        let missing = match doc.get("time") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            if let Value::Object(map) = &mut doc {
                map.insert(
                    "time".to_string(),
                    Value::String(received_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
        }
    }

    let mut object = CumulocityObject::new(api.cumulocity_type(), doc);
    object.action = action_from_method(routing.context.get(tokens::CTX_METHOD)).unwrap_or_default();
    object.external_source = routing
        .external_id
        .map(|id| vec![ExternalSource::new(id, mapping.external_id_type.clone())])
        .unwrap_or_default();
    object.source_id = routing.source_id;
    object.context_data = routing.context;
    DomainAction::Platform(object)
}

fn device_message(doc: Value, routing: Routing, mapping: &Mapping) -> DomainAction {
    let mut rendered = routing
        .context
        .get(tokens::CTX_PUBLISH_TOPIC)
        .cloned()
        .unwrap_or_else(|| mapping.publish_topic.clone());
    for (level, value) in &routing.topic_levels {
        rendered = topic::replace_level(&rendered, *level, value);
    }
    rendered = topic::render_publish_topic(&rendered, routing.external_id.as_deref());

    let retain = routing
        .context
        .get(tokens::CTX_RETAIN)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let transport_fields = routing
        .context
        .get(tokens::CTX_KEY)
        .map(|key| BTreeMap::from([(tokens::CTX_KEY.to_string(), key.clone())]))
        .unwrap_or_default();

    DomainAction::Device(DeviceMessage {
        payload: doc,
        topic: rendered,
        client_id: None,
        retain,
        transport_fields,
        external_source: vec![ExternalSource::new(
            routing.external_id.unwrap_or_default(),
            mapping.external_id_type.clone(),
        )],
        action: action_from_method(routing.context.get(tokens::CTX_METHOD)).unwrap_or_default(),
        cumulocity_type: Some(mapping.target_api.cumulocity_type()),
        source_id: routing.source_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dynmap_core::action::CumulocityType;
    use dynmap_core::mapping::Direction;
    use dynmap_core::substitution::{SubstituteValue, Substitution};
    use serde_json::json;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 12, 15, 49, 38).unwrap()
    }

    fn push(result: &mut SubstitutionResult, target: &str, value: Value, strategy: RepairStrategy) {
        let sub = Substitution::new("x", target).with_repair(strategy);
        result.push(target, ResolvedValue::new(SubstituteValue::infer(value), &sub));
    }

    fn push_expanded(result: &mut SubstitutionResult, target: &str, values: &[Value]) {
        let sub = Substitution::new("x", target)
            .with_repair(RepairStrategy::CreateIfMissing)
            .expanded();
        result.mark_expanded(target);
        for value in values {
            result.push(target, ResolvedValue::new(SubstituteValue::infer(value.clone()), &sub));
        }
    }

    fn mapping() -> Mapping {
        Mapping::new("m", "t/+", TargetApi::Measurement)
    }

    #[test]
    fn test_empty_result_yields_skeleton_with_time() {
        let m = mapping();
        let assembly = assemble(&SubstitutionResult::new(), &m, &m.skeleton().unwrap(), received());

        assert_eq!(assembly.actions.len(), 1);
        assert!(assembly.errors.is_empty());
        let obj = assembly.actions[0].as_platform().unwrap();
        assert_eq!(
            obj.payload,
            json!({"source": {"id": ""}, "type": "", "time": "2025-01-12T15:49:38.000Z"})
        );
        assert_eq!(obj.cumulocity_type, CumulocityType::Measurement);
    }

    #[test]
    fn test_fan_out_zip_and_broadcast() {
        let mut result = SubstitutionResult::new();
        push_expanded(&mut result, "c8y_V.V.value", &[json!(1), json!(2), json!(3)]);
        push_expanded(&mut result, "type", &[json!("a"), json!("b"), json!("c")]);
        push(&mut result, "_IDENTITY_.externalId", json!("dev-1"), RepairStrategy::Default);

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        assert_eq!(assembly.actions.len(), 3);
        let types = ["a", "b", "c"];
        for (i, action) in assembly.actions.iter().enumerate() {
            let obj = action.as_platform().unwrap();
            assert_eq!(obj.payload["c8y_V"]["V"]["value"], json!(i + 1));
            assert_eq!(obj.payload["type"], Value::from(types[i]));
            assert_eq!(obj.external_source, vec![ExternalSource::new("dev-1", "c8y_Serial")]);
        }
    }

    #[test]
    fn test_fan_out_mismatch_truncates() {
        let mut result = SubstitutionResult::new();
        push_expanded(&mut result, "a", &[json!(1), json!(2), json!(3)]);
        push_expanded(&mut result, "b", &[json!(1), json!(2)]);
        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        assert_eq!(assembly.actions.len(), 2);
        assert!(matches!(
            assembly.errors[0],
            ProcessingError::FanOutMismatch { used: 2, .. }
        ));
    }

    #[test]
    fn test_single_element_expansion_against_longer_one_is_a_mismatch() {
        let mut result = SubstitutionResult::new();
        push_expanded(&mut result, "a", &[json!(1), json!(2), json!(3)]);
        push_expanded(&mut result, "b", &[json!(9)]);

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        assert_eq!(assembly.actions.len(), 1);
        assert_eq!(assembly.actions[0].payload()["a"], json!(1));
        assert_eq!(assembly.actions[0].payload()["b"], json!(9));
        match &assembly.errors[0] {
            ProcessingError::FanOutMismatch { lengths, used } => {
                assert_eq!(*used, 1);
                assert_eq!(lengths["a"], 3);
                assert_eq!(lengths["b"], 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_empty_expansion_yields_no_documents() {
        let mut result = SubstitutionResult::new();
        push_expanded(&mut result, "c8y_V.V.value", &[]);
        push(&mut result, "_IDENTITY_.externalId", json!("dev-1"), RepairStrategy::Default);

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        assert!(assembly.actions.is_empty());
        assert!(assembly.errors.is_empty());
    }

    #[test]
    fn test_repeated_plain_target_is_broadcast() {
        let mut result = SubstitutionResult::new();
        push(&mut result, "type", json!("first"), RepairStrategy::Default);
        push(&mut result, "type", json!("second"), RepairStrategy::Default);

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        assert_eq!(assembly.actions.len(), 1);
        assert_eq!(assembly.actions[0].payload()["type"], json!("second"));
    }

    #[test]
    fn test_repair_strategies() {
        let mut result = SubstitutionResult::new();
        push(&mut result, "deep.nested.value", json!(1), RepairStrategy::CreateIfMissing);
        push(&mut result, "other.nested.value", json!(2), RepairStrategy::Default);
        let sub = Substitution::new("gone", "type").with_repair(RepairStrategy::RemoveIfMissing);
        result.push("type", ResolvedValue::new(SubstituteValue::Ignore, &sub));

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        let payload = assembly.actions[0].payload();
        assert_eq!(payload["deep"]["nested"]["value"], json!(1));
        assert!(payload.get("other").is_none());
        assert!(payload.get("type").is_none());
        assert_eq!(assembly.errors.len(), 1);
        assert!(matches!(assembly.errors[0], ProcessingError::Repair { .. }));
    }

    #[test]
    fn test_source_id_and_context_overrides() {
        let mut result = SubstitutionResult::new();
        push(&mut result, "_IDENTITY_.c8ySourceId", json!("4711"), RepairStrategy::Default);
        push(&mut result, "_CONTEXT_DATA_.api", json!("EVENT"), RepairStrategy::Default);
        push(&mut result, "_CONTEXT_DATA_.method", json!("PUT"), RepairStrategy::Default);

        let m = mapping();
        let assembly = assemble(&result, &m, &m.skeleton().unwrap(), received());
        let obj = assembly.actions[0].as_platform().unwrap();
        assert_eq!(obj.cumulocity_type, CumulocityType::Event);
        assert_eq!(obj.action, ActionKind::Update);
        assert_eq!(obj.source_id.as_deref(), Some("4711"));
        assert_eq!(obj.payload["source"]["id"], json!("4711"));
        assert_eq!(obj.context_data.get("method").map(String::as_str), Some("PUT"));
    }

    #[test]
    fn test_outbound_topic_rendering() {
        let mut m = Mapping::new("out", "operations/+", TargetApi::Operation);
        m.direction = Direction::Outbound;
        m.publish_topic = "evt/outbound/+".to_string();

        let mut result = SubstitutionResult::new();
        push(&mut result, "_IDENTITY_.externalId", json!("berlin_01"), RepairStrategy::Default);
        push(&mut result, "_TOPIC_LEVEL_[1]", json!("commands"), RepairStrategy::Default);
        push(&mut result, "_CONTEXT_DATA_.retain", json!("true"), RepairStrategy::Default);
        push(&mut result, "_CONTEXT_DATA_.key", json!("berlin_01"), RepairStrategy::Default);
        push(&mut result, "cmd", json!("restart"), RepairStrategy::Default);

        let assembly = assemble(&result, &m, &json!({"cmd": ""}), received());
        let msg = assembly.actions[0].as_device().unwrap();
        assert_eq!(msg.topic, "evt/commands/berlin_01");
        assert!(msg.retain);
        assert_eq!(msg.transport_fields.get("key").map(String::as_str), Some("berlin_01"));
        assert_eq!(msg.payload, json!({"cmd": "restart"}));
        assert_eq!(msg.external_source[0].external_id, "berlin_01");
    }
}
