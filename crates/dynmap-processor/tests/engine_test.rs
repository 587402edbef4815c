//! End-to-end tests for the mapping engine against the in-memory platform.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};

use dynmap_core::config::EngineConfig;
use dynmap_core::diagnostics::ProcessingStage;
use dynmap_core::mapping::{
    ColumnType, CsvColumn, CsvFormat, Direction, Mapping, MappingType, SnoopStatus, TargetApi,
};
use dynmap_core::substitution::{RepairStrategy, Substitution};
use dynmap_processor::{
    InMemoryPlatform, InMemoryTransport, MappingEngine, OutcomeState, TransportMessage,
};
use dynmap_storage::{MappingStore, MemoryStateStore};

fn engine(platform: Arc<InMemoryPlatform>) -> (MappingEngine, Arc<MappingStore>) {
    let store = Arc::new(MappingStore::memory(Arc::new(MemoryStateStore::new())));
    let mut config = EngineConfig::default();
    config.sandbox.timeout_ms = 5_000;
    let engine = MappingEngine::new(config, store.clone(), platform.clone(), platform);
    (engine, store)
}

fn temperature_mapping() -> Mapping {
    Mapping::new("temperature", "testGraalsSingle/+", TargetApi::Measurement)
        .with_template(json!({
            "type": "c8y_TemperatureMeasurement",
            "c8y_TemperatureMeasurement": {"T": {"value": 0, "unit": "C"}}
        }))
        .with_substitution(Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.externalId"))
        .with_substitution(Substitution::new("temperature", "c8y_TemperatureMeasurement.T.value"))
}

fn message(topic: &str, payload: Value) -> TransportMessage {
    TransportMessage::new(topic, payload.to_string().into_bytes())
}

#[tokio::test]
async fn test_single_measurement_for_known_device() {
    let platform = Arc::new(InMemoryPlatform::new());
    let device = platform.add_device("berlin_01", "c8y_Serial", json!({"name": "berlin_01"}));
    let (engine, store) = engine(platform.clone());
    store.upsert(temperature_mapping()).unwrap();

    let outcomes = engine
        .process(message("testGraalsSingle/berlin_01", json!({"temperature": 139.0, "unit": "C"})))
        .await;

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.state, OutcomeState::Acked);
    assert_eq!(outcome.stage, ProcessingStage::Dispatched);
    assert!(outcome.diagnostics.is_empty());

    let sent = platform.requests_for(TargetApi::Measurement);
    assert_eq!(sent.len(), 1);
    let body = &sent[0].body;
    assert_eq!(body["source"]["id"], json!(device));
    assert_eq!(body["type"], json!("c8y_TemperatureMeasurement"));
    assert_eq!(body["c8y_TemperatureMeasurement"]["T"]["value"], json!(139.0));
    assert_eq!(body["c8y_TemperatureMeasurement"]["T"]["unit"], json!("C"));
    assert!(body["time"].as_str().is_some_and(|t| !t.is_empty()));

    let status = engine.status("temperature").unwrap();
    assert_eq!(status.messages_received, 1);
    assert_eq!(status.actions_dispatched, 1);
}

fn csv_mapping() -> Mapping {
    let mut mapping = Mapping::new("csv", "csv/+", TargetApi::Measurement)
        .with_template(json!({
            "type": "c8y_TemperatureMeasurement",
            "c8y_Temperature": {"T": {"value": 0, "unit": "C"}}
        }))
        .with_substitution(Substitution::new("deviceId", "_IDENTITY_.externalId"))
        .with_substitution(Substitution::new("rows.time", "time").expanded())
        .with_substitution(
            Substitution::new("rows.temperature", "c8y_Temperature.T.value").expanded(),
        );
    mapping.mapping_type = MappingType::Csv;
    mapping.create_non_existing_device = true;
    mapping.csv_format = Some(CsvFormat {
        columns: vec![
            CsvColumn::new("time", ColumnType::Timestamp),
            CsvColumn::new("status", ColumnType::Number),
            CsvColumn::new("temperature", ColumnType::Number),
        ],
        ..CsvFormat::default()
    });
    mapping
}

#[tokio::test]
async fn test_csv_rows_fan_out() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    store.upsert(csv_mapping()).unwrap();

    let payload = "351144440855493\n\
                   01/12/2025 15:49:38,0,+021.63\n\
                   01/12/2025 15:50:38,0,+022.10\n\
                   01/12/2025 15:51:38,1,-003.50\n";
    let outcomes = engine
        .process(TransportMessage::new("csv/gateway", payload.as_bytes().to_vec()))
        .await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    assert_eq!(outcomes[0].actions.len(), 3);
    for action in &outcomes[0].actions {
        let source = &action.external_source()[0];
        assert_eq!(source.external_id, "351144440855493");
        assert_eq!(source.id_type, "c8y_Serial");
    }

    let sent = platform.requests_for(TargetApi::Measurement);
    let mut values: Vec<f64> = sent
        .iter()
        .filter_map(|r| r.body["c8y_Temperature"]["T"]["value"].as_f64())
        .collect();
    values.sort_by(f64::total_cmp);
    assert_eq!(values, vec![-3.5, 21.63, 22.1]);
    assert!(sent
        .iter()
        .any(|r| r.body["time"] == json!("2025-01-12T15:49:38.000Z")));

    // Three concurrent actions for one unknown device create it once.
    assert_eq!(platform.created_count(), 1);
    assert!(platform.external_id_of("351144440855493", "c8y_Serial").is_some());
}

#[tokio::test]
async fn test_csv_batch_without_valid_rows_sends_nothing() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    store.upsert(csv_mapping()).unwrap();

    let payload = "351144440855493\n\
                   13/45/2025 15:49:38,0,+021.63\n\
                   01/12/2025 15:50:38,0,warm\n";
    let outcomes = engine
        .process(TransportMessage::new("csv/gateway", payload.as_bytes().to_vec()))
        .await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    assert!(outcomes[0].actions.is_empty());
    assert_eq!(outcomes[0].diagnostics.len(), 2);
    assert!(platform.requests().is_empty());
    assert_eq!(platform.created_count(), 0);
}

#[tokio::test]
async fn test_smart_function_returning_nothing() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    store
        .upsert(
            Mapping::new("sf", "sf/+", TargetApi::Measurement)
                .with_code("function onMessage(msg, context) { return []; }"),
        )
        .unwrap();

    let outcomes = engine.process(message("sf/dev", json!({"t": 1}))).await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    assert!(outcomes[0].actions.is_empty());
    assert!(outcomes[0].diagnostics.is_empty());
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_smart_function_measurement() {
    let platform = Arc::new(InMemoryPlatform::new());
    let device = platform.add_device("berlin_01", "c8y_Serial", json!({}));
    let (engine, store) = engine(platform.clone());
    let code = r#"
function onMessage(msg, context) {
  const payload = msg.getPayload();
  context.setState('last', payload.temperature);
  return [{
    cumulocityType: 'measurement',
    action: 'create',
    payload: { type: 'c8y_T', c8y_T: { T: { value: payload.temperature, unit: 'C' } } },
    externalSource: [{ type: 'c8y_Serial', externalId: msg.getTopicLevels()[1] }]
  }];
}
"#;
    store
        .upsert(Mapping::new("sf", "sf/+", TargetApi::Measurement).with_code(code))
        .unwrap();

    let outcomes = engine.process(message("sf/berlin_01", json!({"temperature": 21.5}))).await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    let sent = platform.requests_for(TargetApi::Measurement);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["source"]["id"], json!(device));
    assert_eq!(sent[0].body["c8y_T"]["T"]["value"], json!(21.5));
}

#[tokio::test]
async fn test_script_error_fails_without_dispatch() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    store
        .upsert(
            Mapping::new("sf", "sf/+", TargetApi::Measurement)
                .with_code("function onMessage(msg, context) { throw new Error('boom'); }"),
        )
        .unwrap();

    let outcomes = engine.process(message("sf/dev", json!({}))).await;

    assert_eq!(
        outcomes[0].state,
        OutcomeState::Failed {
            stage: ProcessingStage::Normalized
        }
    );
    assert_eq!(outcomes[0].diagnostics.count("script"), 1);
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_empty_substitutions_yield_template() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, _store) = engine(platform);
    let template = json!({
        "source": {"id": "4711"},
        "type": "c8y_Static",
        "time": "2025-01-01T00:00:00.000Z",
        "c8y_Static": {"S": {"value": 1}}
    });
    let mapping = Mapping::new("static", "static/+", TargetApi::Measurement).with_template(template.clone());

    let outcome = engine.test(&mapping, &message("static/x", json!({"ignored": true}))).await;

    assert_eq!(outcome.state, OutcomeState::DryRun);
    assert_eq!(outcome.actions.len(), 1);
    assert_eq!(outcome.actions[0].payload(), &template);
}

#[tokio::test]
async fn test_identical_source_and_target_round_trips() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, _store) = engine(platform);
    let mapping = Mapping::new("same", "same/+", TargetApi::Measurement)
        .with_template(json!({"type": "c8y_T", "c8y_T": {"T": {"value": 0, "unit": "C"}}}))
        .with_substitution(Substitution::new("c8y_T.T.value", "c8y_T.T.value"))
        .with_substitution(Substitution::new("c8y_T.T.unit", "c8y_T.T.unit"));
    let document = json!({"c8y_T": {"T": {"value": 42.5, "unit": "F"}}});

    let outcome = engine.test(&mapping, &message("same/x", document.clone())).await;

    assert_eq!(outcome.actions[0].payload()["c8y_T"], document["c8y_T"]);
}

#[tokio::test]
async fn test_repair_strategies_end_to_end() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, _store) = engine(platform);
    let mapping = Mapping::new("repair", "r/+", TargetApi::Measurement)
        .with_template(json!({"type": "c8y_R"}))
        .with_substitution(
            Substitution::new("t", "created.deep.value").with_repair(RepairStrategy::CreateIfMissing),
        )
        .with_substitution(Substitution::new("t", "dropped.deep.value"));

    let outcome = engine.test(&mapping, &message("r/x", json!({"t": 5}))).await;

    let payload = outcome.actions[0].payload();
    assert_eq!(payload["created"]["deep"]["value"], json!(5));
    assert!(payload.get("dropped").is_none());
}

#[tokio::test]
async fn test_filter_skips_messages() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_device("berlin_01", "c8y_Serial", json!({}));
    let (engine, store) = engine(platform.clone());
    let mut mapping = temperature_mapping();
    mapping.filter_mapping = Some("temperature > 100".to_string());
    store.upsert(mapping).unwrap();

    let cold = engine
        .process(message("testGraalsSingle/berlin_01", json!({"temperature": 50})))
        .await;
    assert_eq!(cold[0].state, OutcomeState::Filtered);
    assert!(platform.requests().is_empty());

    let hot = engine
        .process(message("testGraalsSingle/berlin_01", json!({"temperature": 139.0})))
        .await;
    assert_eq!(hot[0].state, OutcomeState::Acked);
    assert_eq!(platform.requests_for(TargetApi::Measurement).len(), 1);
}

#[tokio::test]
async fn test_unparseable_payload_fails_at_received() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    store.upsert(temperature_mapping()).unwrap();

    let outcomes = engine
        .process(TransportMessage::new("testGraalsSingle/berlin_01", b"{not json".to_vec()))
        .await;

    assert_eq!(
        outcomes[0].state,
        OutcomeState::Failed {
            stage: ProcessingStage::Received
        }
    );
    assert_eq!(outcomes[0].diagnostics.count("parse"), 1);
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_repeated_failures_deactivate_mapping() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform);
    let mut mapping = temperature_mapping();
    mapping.max_failure_count = 2;
    store.upsert(mapping).unwrap();

    for _ in 0..2 {
        let outcomes = engine
            .process(message("testGraalsSingle/unknown", json!({"temperature": 1})))
            .await;
        assert!(outcomes[0].is_failed());
    }

    assert!(!store.get("temperature").unwrap().active);
    assert_eq!(engine.status("temperature").unwrap().consecutive_failures, 2);
    let after = engine
        .process(message("testGraalsSingle/unknown", json!({"temperature": 1})))
        .await;
    assert!(after.is_empty());
}

#[tokio::test]
async fn test_dry_run_creates_nothing() {
    let platform = Arc::new(InMemoryPlatform::new());
    let known = platform.add_device("berlin_01", "c8y_Serial", json!({}));
    let (engine, _store) = engine(platform.clone());
    let mut mapping = temperature_mapping();
    mapping.create_non_existing_device = true;

    let unknown = engine
        .test(&mapping, &message("testGraalsSingle/berlin_02", json!({"temperature": 1})))
        .await;
    assert_eq!(unknown.state, OutcomeState::DryRun);
    assert_eq!(unknown.actions[0].source_id(), None);

    let existing = engine
        .test(&mapping, &message("testGraalsSingle/berlin_01", json!({"temperature": 1})))
        .await;
    assert_eq!(existing.actions[0].source_id(), Some(known.as_str()));
    assert_eq!(existing.actions[0].payload()["source"]["id"], json!(known));

    assert_eq!(platform.created_count(), 0);
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_snooping_records_payloads() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    let mut mapping = temperature_mapping();
    mapping.snoop_status = SnoopStatus::Enabled;
    store.upsert(mapping).unwrap();

    for t in [1, 2] {
        let outcomes = engine
            .process(message("testGraalsSingle/berlin_01", json!({"temperature": t})))
            .await;
        assert_eq!(outcomes[0].state, OutcomeState::Snooped);
    }

    let stored = store.get("temperature").unwrap();
    assert_eq!(stored.snoop_status, SnoopStatus::Started);
    assert_eq!(stored.snooped_templates.len(), 2);
    assert!(platform.requests().is_empty());
}

#[tokio::test]
async fn test_outbound_renders_topic_from_reverse_lookup() {
    let platform = Arc::new(InMemoryPlatform::new());
    let device = platform.add_device("berlin_01", "c8y_Serial", json!({}));
    let transport = Arc::new(InMemoryTransport::new());
    let (engine, store) = engine(platform);
    let engine = engine.with_transport(transport.clone());

    let mut mapping = Mapping::new("out", "measurement/+", TargetApi::Measurement)
        .with_template(json!({}))
        .with_substitution(Substitution::new("source.id", "_IDENTITY_.c8ySourceId"))
        .with_substitution(Substitution::new("c8y_T.T.value", "temp"));
    mapping.direction = Direction::Outbound;
    mapping.publish_topic = "devices/+/measurements".to_string();
    store.upsert(mapping).unwrap();

    let object = json!({"source": {"id": device}, "c8y_T": {"T": {"value": 21}}});
    let outcomes = engine
        .process_outbound(TargetApi::Measurement, message("measurement/create", object))
        .await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "devices/berlin_01/measurements");
    let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(payload["temp"], json!(21));
}

#[tokio::test]
async fn test_delete_mapping_clears_status() {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_device("berlin_01", "c8y_Serial", json!({}));
    let (engine, store) = engine(platform);
    store.upsert(temperature_mapping()).unwrap();
    engine
        .process(message("testGraalsSingle/berlin_01", json!({"temperature": 1})))
        .await;
    assert!(engine.status("temperature").is_some());

    assert!(engine.delete_mapping("temperature").await.unwrap());
    assert!(engine.status("temperature").is_none());
    assert!(store.get("temperature").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_create_device_once() {
    let platform = Arc::new(InMemoryPlatform::new().with_latency(Duration::from_millis(20)));
    let (engine, store) = engine(platform.clone());
    let mut mapping = temperature_mapping();
    mapping.create_non_existing_device = true;
    store.upsert(mapping).unwrap();

    let messages = (0..10).map(|i| {
        engine.process(message("testGraalsSingle/fresh_device", json!({"temperature": i})))
    });
    let outcomes: Vec<_> = join_all(messages).await.into_iter().flatten().collect();

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|o| o.state == OutcomeState::Acked));
    assert_eq!(platform.created_count(), 1);
    assert_eq!(platform.requests_for(TargetApi::Measurement).len(), 10);
}

#[tokio::test]
async fn test_failed_registration_keeps_created_device() {
    let platform = Arc::new(InMemoryPlatform::new());
    let (engine, store) = engine(platform.clone());
    let mut mapping = temperature_mapping();
    mapping.create_non_existing_device = true;
    store.upsert(mapping).unwrap();
    platform.fail_registrations(1);

    let first = engine
        .process(message("testGraalsSingle/fresh_device", json!({"temperature": 1})))
        .await;
    assert_eq!(
        first[0].state,
        OutcomeState::Failed {
            stage: ProcessingStage::Dispatched
        }
    );
    assert!(platform.requests_for(TargetApi::Measurement).is_empty());

    let second = engine
        .process(message("testGraalsSingle/fresh_device", json!({"temperature": 2})))
        .await;
    assert_eq!(second[0].state, OutcomeState::Acked);
    assert_eq!(platform.created_count(), 1);

    let device = platform.external_id_of("fresh_device", "c8y_Serial").unwrap();
    let sent = platform.requests_for(TargetApi::Measurement);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["source"]["id"], json!(device));
}

#[tokio::test]
async fn test_resolved_devices_are_visible_to_smart_functions() {
    let platform = Arc::new(InMemoryPlatform::new());
    let device = platform.add_device("berlin_01", "c8y_Serial", json!({"name": "Berlin 01"}));
    let (engine, store) = engine(platform.clone());
    store.upsert(temperature_mapping()).unwrap();
    let code = r#"
function onMessage(msg, context) {
  const device = context.getManagedObject({ externalId: 'berlin_01', type: 'c8y_Serial' });
  return [{
    cumulocityType: 'event',
    action: 'create',
    payload: { type: 'c8y_Seen', text: device === null ? 'unknown' : device.name },
    sourceId: device === null ? '0' : device.id
  }];
}
"#;
    store
        .upsert(Mapping::new("lookup", "lookup/+", TargetApi::Event).with_code(code))
        .unwrap();

    engine
        .process(message("testGraalsSingle/berlin_01", json!({"temperature": 20.0})))
        .await;
    let outcomes = engine.process(message("lookup/any", json!({}))).await;

    assert_eq!(outcomes[0].state, OutcomeState::Acked);
    let events = platform.requests_for(TargetApi::Event);
    assert_eq!(events[0].body["text"], json!("Berlin 01"));
    assert_eq!(events[0].body["source"]["id"], json!(device));
    assert!(engine.inventory_cache().get(&device).is_some());
}
