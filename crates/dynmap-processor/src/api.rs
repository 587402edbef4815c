//! Collaborator interfaces: the platform and the outbound transport.
//!
//! The engine never talks to a concrete service. Identity lookups go through
//! [`InventoryApi`], domain objects through [`PlatformApi`] and device
//! messages through [`OutboundTransport`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dynmap_core::action::{ExternalSource, HttpMethod};
use dynmap_core::mapping::{Qos, TargetApi};

/// Errors returned by platform and transport implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The platform answered with a non-2xx status.
    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Serialization(e.to_string())
    }
}

/// Binary attached to an event after it was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub data: String,
}

/// One call against a platform API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRequest {
    pub api: TargetApi,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub body: Value,
    /// `X-Cumulocity-Processing-Mode` header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl PlatformRequest {
    pub fn new(api: TargetApi, method: HttpMethod, body: Value) -> Self {
        Self {
            api,
            method,
            source_id: None,
            body,
            processing_mode: None,
            attachment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

impl PlatformResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Id of the object the platform created or updated.
    pub fn object_id(&self) -> Option<String> {
        match self.body.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A message handed to the outbound transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    #[serde(default)]
    pub transport_fields: BTreeMap<String, String>,
}

/// Inventory and identity services.
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Managed object by platform id.
    async fn get_managed_object(&self, id: &str) -> Result<Option<Value>, ApiError>;

    /// Platform id registered for an external id.
    async fn lookup_external_id(
        &self,
        external_id: &str,
        id_type: &str,
    ) -> Result<Option<String>, ApiError>;

    /// External ids registered for a platform id.
    async fn reverse_external_ids(&self, global_id: &str) -> Result<Vec<ExternalSource>, ApiError>;

    /// Create a managed object and return its id.
    async fn create_managed_object(&self, body: Value) -> Result<String, ApiError>;

    /// Register an external id for a platform id.
    async fn register_external_id(
        &self,
        global_id: &str,
        external_id: &str,
        id_type: &str,
    ) -> Result<(), ApiError>;
}

/// Domain object APIs (measurement, event, alarm, operation, inventory).
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse, ApiError>;
}

/// Device-facing transport used for outbound mappings.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), ApiError>;
}
