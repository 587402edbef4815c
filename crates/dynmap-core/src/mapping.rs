//! Mapping definitions.
//!
//! A [`Mapping`] describes how messages on a topic are turned into domain
//! objects: either by an ordered list of declarative substitutions merged
//! into a target template, or by a Smart Function. The JSON form uses the
//! camelCase field names the configuration service stores.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::CumulocityType;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::path::{SourcePath, TargetPath};
use crate::substitution::{Substitution, TargetKind};
use crate::topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

/// How a mapping produces its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformationType {
    /// Declarative substitutions.
    #[default]
    Default,
    SmartFunction,
    CodeBased,
}

impl TransformationType {
    pub fn is_scripted(self) -> bool {
        matches!(self, Self::SmartFunction | Self::CodeBased)
    }
}

/// Wire format of incoming payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    Hex,
    Csv,
    Binary,
}

/// Platform API a mapping targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetApi {
    #[default]
    Measurement,
    Event,
    Alarm,
    Operation,
    Inventory,
}

impl TargetApi {
    /// Where the device identifier lives in a document of this API.
    pub fn identifier_path(self) -> &'static str {
        match self {
            Self::Measurement | Self::Event | Self::Alarm => "source.id",
            Self::Operation => "deviceId",
            Self::Inventory => "id",
        }
    }

    /// Minimal document shape used when a mapping has no template.
    pub fn skeleton(self) -> Value {
        match self {
            Self::Measurement => json!({"source": {"id": ""}, "type": "", "time": ""}),
            Self::Event => json!({"source": {"id": ""}, "type": "", "text": "", "time": ""}),
            Self::Alarm => json!({
                "source": {"id": ""},
                "type": "",
                "text": "",
                "severity": "MINOR",
                "time": ""
            }),
            Self::Operation => json!({"deviceId": ""}),
            Self::Inventory => json!({}),
        }
    }

    /// Whether documents of this API carry a `time` field.
    pub fn is_timed(self) -> bool {
        matches!(self, Self::Measurement | Self::Event | Self::Alarm)
    }

    pub fn cumulocity_type(self) -> CumulocityType {
        match self {
            Self::Measurement => CumulocityType::Measurement,
            Self::Event => CumulocityType::Event,
            Self::Alarm => CumulocityType::Alarm,
            Self::Operation => CumulocityType::Operation,
            Self::Inventory => CumulocityType::ManagedObject,
        }
    }

    /// Parse the names used in `_CONTEXT_DATA_.api` overrides.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "MEASUREMENT" | "MEASUREMENTS" => Some(Self::Measurement),
            "EVENT" | "EVENTS" => Some(Self::Event),
            "ALARM" | "ALARMS" => Some(Self::Alarm),
            "OPERATION" | "OPERATIONS" => Some(Self::Operation),
            "INVENTORY" | "MANAGEDOBJECT" | "MANAGED_OBJECT" => Some(Self::Inventory),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Measurement => "MEASUREMENT",
            Self::Event => "EVENT",
            Self::Alarm => "ALARM",
            Self::Operation => "OPERATION",
            Self::Inventory => "INVENTORY",
        }
    }
}

impl From<CumulocityType> for TargetApi {
    fn from(value: CumulocityType) -> Self {
        match value {
            CumulocityType::Measurement => Self::Measurement,
            CumulocityType::Event => Self::Event,
            CumulocityType::Alarm => Self::Alarm,
            CumulocityType::Operation => Self::Operation,
            CumulocityType::ManagedObject => Self::Inventory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnoopStatus {
    #[default]
    None,
    Enabled,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// Type of a CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    #[default]
    Text,
    Number,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvColumn {
    pub name: String,
    #[serde(default, rename = "type")]
    pub column_type: ColumnType,
}

impl CsvColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

fn default_timestamp_format() -> String {
    "%m/%d/%Y %H:%M:%S".to_string()
}

/// Column layout of CSV payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvFormat {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub device_id_in_first_line: bool,
    /// chrono format of timestamp columns, interpreted as UTC.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    pub columns: Vec<CsvColumn>,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            device_id_in_first_line: true,
            timestamp_format: default_timestamp_format(),
            columns: Vec::new(),
        }
    }
}

fn default_external_id_type() -> String {
    "c8y_Serial".to_string()
}

/// A mapping definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub id: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub transformation_type: TransformationType,
    #[serde(default)]
    pub mapping_type: MappingType,
    #[serde(default, rename = "targetAPI")]
    pub target_api: TargetApi,
    pub mapping_topic: String,
    #[serde(default)]
    pub publish_topic: String,
    #[serde(default)]
    pub target_template: String,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub snoop_status: SnoopStatus,
    #[serde(default)]
    pub snooped_templates: Vec<String>,
    #[serde(default)]
    pub create_non_existing_device: bool,
    #[serde(default)]
    pub update_existing_device: bool,
    #[serde(default = "default_true")]
    pub use_external_id: bool,
    #[serde(default = "default_external_id_type")]
    pub external_id_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_format: Option<CsvFormat>,
    #[serde(default)]
    pub qos: Qos,
    /// Consecutive failures before the mapping is deactivated; 0 disables.
    #[serde(default)]
    pub max_failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    /// Confirms that several substitutions may write the same target.
    #[serde(default)]
    pub allow_duplicate_targets: bool,
}

impl Mapping {
    /// A declarative inbound mapping with defaults for everything else.
    pub fn new(id: impl Into<String>, topic: impl Into<String>, target_api: TargetApi) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            name: id.clone(),
            id,
            direction: Direction::Inbound,
            transformation_type: TransformationType::Default,
            mapping_type: MappingType::Json,
            target_api,
            mapping_topic: topic.into(),
            publish_topic: String::new(),
            target_template: String::new(),
            substitutions: Vec::new(),
            code: None,
            active: true,
            debug: false,
            snoop_status: SnoopStatus::None,
            snooped_templates: Vec::new(),
            create_non_existing_device: false,
            update_existing_device: false,
            use_external_id: true,
            external_id_type: default_external_id_type(),
            filter_mapping: None,
            csv_format: None,
            qos: Qos::AtLeastOnce,
            max_failure_count: 0,
            last_update: None,
            allow_duplicate_targets: false,
        }
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.target_template = template.to_string();
        self
    }

    pub fn with_substitution(mut self, substitution: Substitution) -> Self {
        self.substitutions.push(substitution);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.transformation_type = TransformationType::SmartFunction;
        self.code = Some(code.into());
        self
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Parsed target template, or the API's minimal shape when empty.
    pub fn skeleton(&self) -> Result<Value> {
        if self.target_template.trim().is_empty() {
            return Ok(self.target_api.skeleton());
        }
        let value: Value = serde_json::from_str(&self.target_template).map_err(|e| {
            Error::InvalidMapping(format!("mapping '{}': targetTemplate: {}", self.id, e))
        })?;
        if !value.is_object() {
            return Err(Error::InvalidMapping(format!(
                "mapping '{}': targetTemplate must be a JSON object",
                self.id
            )));
        }
        Ok(value)
    }

    /// Smart Function source. Stored code is base64 encoded; plain text is
    /// accepted as-is.
    pub fn decoded_code(&self) -> Result<Option<String>> {
        let Some(code) = self.code.as_deref() else {
            return Ok(None);
        };
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let decoded = STANDARD
            .decode(trimmed)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        Ok(Some(decoded.unwrap_or_else(|| trimmed.to_string())))
    }

    /// Check the mapping is internally consistent before it is used.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidMapping(format!("mapping '{}': {}", self.id, reason));

        if self.id.trim().is_empty() {
            return Err(Error::InvalidMapping("mapping id is empty".to_string()));
        }
        topic::validate_filter(&self.mapping_topic)?;
        if self.direction == Direction::Outbound && self.publish_topic.trim().is_empty() {
            return Err(invalid("outbound mappings need a publishTopic".to_string()));
        }
        if self.external_id_type.trim().is_empty() && self.use_external_id {
            return Err(invalid("externalIdType is empty".to_string()));
        }
        self.skeleton()?;
        if let Some(filter) = self.filter_mapping.as_deref().filter(|f| !f.trim().is_empty()) {
            Filter::parse(filter)?;
        }

        if self.transformation_type.is_scripted() {
            if self.decoded_code()?.is_none() {
                return Err(invalid("Smart Function mappings need code".to_string()));
            }
            return Ok(());
        }

        let mut seen = HashSet::new();
        for sub in &self.substitutions {
            if sub.path_target.trim().is_empty() {
                return Err(invalid(format!(
                    "substitution from '{}' has an empty pathTarget",
                    sub.path_source
                )));
            }
            SourcePath::parse(&sub.path_source)?;
            if let TargetKind::Body(target) = TargetKind::classify(&sub.path_target) {
                TargetPath::parse(target)?;
            }
            if !seen.insert(sub.path_target.trim()) && !self.allow_duplicate_targets {
                return Err(invalid(format!(
                    "duplicate pathTarget '{}'",
                    sub.path_target.trim()
                )));
            }
        }

        if self.mapping_type == MappingType::Csv {
            let format = self
                .csv_format
                .as_ref()
                .ok_or_else(|| invalid("CSV mappings need a csvFormat".to_string()))?;
            if format.columns.is_empty() {
                return Err(invalid("csvFormat has no columns".to_string()));
            }
        }
        Ok(())
    }
}
