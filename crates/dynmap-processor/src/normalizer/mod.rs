//! Payload normalization.
//!
//! Raw transport bytes are decoded by the [`PayloadNormalizer`] selected from
//! the mapping's `mappingType`, then the object root is enriched with the
//! topic levels and context data every mapping can address.

mod binary;
mod csv;
mod json;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use dynmap_core::config::defaults;
use dynmap_core::diagnostics::ProcessingError;
use dynmap_core::mapping::{Mapping, MappingType};
use dynmap_core::substitution::tokens;
use dynmap_core::topic;

pub use self::binary::{FlatFileNormalizer, HexNormalizer};
pub use self::csv::CsvNormalizer;
pub use self::json::JsonNormalizer;

/// A message as delivered by a transport adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            key: None,
            client_id: None,
            message_id: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Output of a format decoder, before enrichment.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub root: Value,
    /// Local problems (skipped CSV rows) that did not fail the message.
    pub warnings: Vec<ProcessingError>,
}

impl Decoded {
    pub fn new(root: Value) -> Self {
        Self {
            root,
            warnings: Vec::new(),
        }
    }
}

/// Decodes raw bytes of one wire format.
pub trait PayloadNormalizer: Send + Sync {
    fn decode(&self, payload: &[u8], mapping: &Mapping) -> Result<Decoded, String>;
}

/// Decoder for a mapping type.
pub fn normalizer_for(mapping_type: MappingType) -> &'static dyn PayloadNormalizer {
    match mapping_type {
        MappingType::Json => &JsonNormalizer,
        MappingType::FlatFile => &FlatFileNormalizer,
        MappingType::Hex | MappingType::Binary => &HexNormalizer,
        MappingType::Csv => &CsvNormalizer,
    }
}

/// A decoded, enriched message ready for resolution.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// Decoded payload as the device sent it.
    pub payload: Value,
    /// Payload with `_TOPIC_LEVEL_` and `_CONTEXT_DATA_` added.
    pub document: Value,
    pub topic: String,
    pub topic_levels: Vec<String>,
    pub message_id: String,
    pub client_id: Option<String>,
    pub key: Option<String>,
    pub received_at: DateTime<Utc>,
    pub warnings: Vec<ProcessingError>,
}

impl NormalizedMessage {
    pub fn transport_fields(&self) -> BTreeMap<String, String> {
        self.key
            .iter()
            .map(|key| (tokens::CTX_KEY.to_string(), key.clone()))
            .collect()
    }
}

/// Decode and enrich a message for one mapping.
pub fn normalize(
    message: &TransportMessage,
    mapping: &Mapping,
) -> Result<NormalizedMessage, ProcessingError> {
    let decoded = normalizer_for(mapping.mapping_type)
        .decode(&message.payload, mapping)
        .map_err(|reason| ProcessingError::parse(reason, &message.payload, defaults::RAW_SAMPLE_BYTES))?;

    let topic_levels = topic::split_levels(&message.topic);
    let mut context = Map::new();
    if let Some(key) = &message.key {
        context.insert(tokens::CTX_KEY.to_string(), Value::String(key.clone()));
    }
    context.insert(
        tokens::CTX_API.to_string(),
        Value::String(mapping.target_api.name().to_string()),
    );

    let mut document = decoded.root.clone();
    if let Value::Object(root) = &mut document {
        root.insert(
            tokens::TOPIC_LEVEL.to_string(),
            Value::Array(topic_levels.iter().cloned().map(Value::String).collect()),
        );
        root.insert(tokens::CONTEXT_DATA.to_string(), Value::Object(context));
    }

    Ok(NormalizedMessage {
        payload: decoded.root,
        document,
        topic: message.topic.clone(),
        topic_levels,
        message_id: message
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        client_id: message.client_id.clone(),
        key: message.key.clone(),
        received_at: message.received_at,
        warnings: decoded.warnings,
    })
}

/// Non-object roots are addressed as `message`.
pub(crate) fn wrap_message(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut root = Map::new();
            root.insert("message".to_string(), other);
            Value::Object(root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynmap_core::mapping::TargetApi;
    use serde_json::json;

    #[test]
    fn test_enrichment() {
        let mapping = Mapping::new("m", "devices/+/temp", TargetApi::Event);
        let message = TransportMessage::new("devices/berlin_01/temp", br#"{"t": 1}"#.to_vec())
            .with_key("berlin_01")
            .with_message_id("msg-7");

        let normalized = normalize(&message, &mapping).unwrap();
        assert_eq!(normalized.payload, json!({"t": 1}));
        assert_eq!(
            normalized.document,
            json!({
                "t": 1,
                "_TOPIC_LEVEL_": ["devices", "berlin_01", "temp"],
                "_CONTEXT_DATA_": {"key": "berlin_01", "api": "EVENT"}
            })
        );
        assert_eq!(normalized.message_id, "msg-7");
        assert_eq!(normalized.transport_fields().get("key").map(String::as_str), Some("berlin_01"));
    }

    #[test]
    fn test_message_id_generated() {
        let mapping = Mapping::new("m", "a/+", TargetApi::Event);
        let normalized = normalize(&TransportMessage::new("a/b", b"{}".to_vec()), &mapping).unwrap();
        assert!(Uuid::parse_str(&normalized.message_id).is_ok());
    }

    #[test]
    fn test_parse_error_keeps_sample() {
        let mapping = Mapping::new("m", "a/+", TargetApi::Event);
        let payload = vec![b'{'; 400];
        let err = normalize(&TransportMessage::new("a/b", payload), &mapping).unwrap_err();
        match err {
            ProcessingError::Parse { raw_sample, .. } => assert_eq!(raw_sample.len(), 256),
            other => panic!("unexpected {:?}", other),
        }
    }
}
