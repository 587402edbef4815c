//! Domain actions produced by a mapping.
//!
//! Inbound processing yields [`CumulocityObject`]s destined for the platform,
//! outbound processing yields [`DeviceMessage`]s published to a transport.
//! Smart Functions return either kind as plain JSON objects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Platform object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CumulocityType {
    Measurement,
    Event,
    Alarm,
    Operation,
    ManagedObject,
}

impl fmt::Display for CumulocityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Measurement => "measurement",
            Self::Event => "event",
            Self::Alarm => "alarm",
            Self::Operation => "operation",
            Self::ManagedObject => "managedObject",
        };
        f.write_str(s)
    }
}

/// What to do with the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Create,
    Update,
    Delete,
    Patch,
}

impl ActionKind {
    pub fn method(self) -> HttpMethod {
        match self {
            Self::Create => HttpMethod::Post,
            Self::Update => HttpMethod::Put,
            Self::Patch => HttpMethod::Patch,
            Self::Delete => HttpMethod::Delete,
        }
    }
}

/// Request method sent to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported method '{}'", other)),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Where a platform object is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    #[default]
    Cumulocity,
    Iceflow,
    StreamingAnalytics,
}

/// Device identity attached to an action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSource {
    #[serde(default)]
    pub external_id: String,
    #[serde(rename = "type")]
    pub id_type: String,
    #[serde(
        default,
        rename = "autoCreateDeviceMO",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_create_device_mo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ExternalSource {
    pub fn new(external_id: impl Into<String>, id_type: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            id_type: id_type.into(),
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ExternalSource>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(ExternalSource),
        Many(Vec<ExternalSource>),
        Null,
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(source) => vec![source],
        OneOrMany::Many(sources) => sources,
        OneOrMany::Null => Vec::new(),
    })
}

/// An object to create, update or delete in the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulocityObject {
    pub payload: Value,
    pub cumulocity_type: CumulocityType,
    #[serde(default)]
    pub action: ActionKind,
    #[serde(default, deserialize_with = "one_or_many")]
    pub external_source: Vec<ExternalSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_data: BTreeMap<String, String>,
}

impl CumulocityObject {
    pub fn new(cumulocity_type: CumulocityType, payload: Value) -> Self {
        Self {
            payload,
            cumulocity_type,
            action: ActionKind::Create,
            external_source: Vec::new(),
            source_id: None,
            destination: None,
            context_data: BTreeMap::new(),
        }
    }
}

/// A message to publish to a device-facing transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub payload: Value,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transport_fields: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub external_source: Vec<ExternalSource>,
    #[serde(default)]
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulocity_type: Option<CumulocityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl DeviceMessage {
    /// Bytes put on the wire: strings as-is, everything else as JSON.
    pub fn payload_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        }
    }
}

/// A typed result of processing one message with one mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainAction {
    Device(DeviceMessage),
    Platform(CumulocityObject),
}

impl DomainAction {
    /// Interpret an object returned by a Smart Function. Objects carrying a
    /// `topic` are device messages, everything else is a platform object.
    pub fn from_script_value(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected an object, got {}", value));
        }
        if value.get("topic").is_some() {
            serde_json::from_value(value)
                .map(Self::Device)
                .map_err(|e| format!("invalid device message: {}", e))
        } else {
            serde_json::from_value(value)
                .map(Self::Platform)
                .map_err(|e| format!("invalid platform object: {}", e))
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Platform(obj) => &obj.payload,
            Self::Device(msg) => &msg.payload,
        }
    }

    pub fn external_source(&self) -> &[ExternalSource] {
        match self {
            Self::Platform(obj) => &obj.external_source,
            Self::Device(msg) => &msg.external_source,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::Platform(obj) => obj.source_id.as_deref(),
            Self::Device(msg) => msg.source_id.as_deref(),
        }
    }

    pub fn as_platform(&self) -> Option<&CumulocityObject> {
        match self {
            Self::Platform(obj) => Some(obj),
            Self::Device(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<&DeviceMessage> {
        match self {
            Self::Device(msg) => Some(msg),
            Self::Platform(_) => None,
        }
    }
}
