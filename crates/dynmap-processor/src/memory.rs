//! In-process platform and transport.
//!
//! Used by tests, by dry runs and by the CLI. Requests are recorded so
//! callers can inspect exactly what the engine would have sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dynmap_core::action::{ExternalSource, HttpMethod};
use dynmap_core::mapping::TargetApi;

use crate::api::{
    ApiError, InventoryApi, OutboundMessage, OutboundTransport, PlatformApi, PlatformRequest,
    PlatformResponse,
};

/// Inventory, identity and domain APIs backed by memory.
pub struct InMemoryPlatform {
    managed_objects: DashMap<String, Value>,
    // (type, externalId) -> platform id
    external_ids: DashMap<(String, String), String>,
    requests: Mutex<Vec<PlatformRequest>>,
    failures: Mutex<HashMap<TargetApi, u16>>,
    next_id: AtomicU64,
    creations: AtomicUsize,
    registration_failures: AtomicUsize,
    latency: Option<Duration>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            managed_objects: DashMap::new(),
            external_ids: DashMap::new(),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1000),
            creations: AtomicUsize::new(0),
            registration_failures: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Register a device and return its platform id.
    pub fn add_device(&self, external_id: &str, id_type: &str, body: Value) -> String {
        let id = self.allocate_id();
        let mut object = body;
        if let Value::Object(map) = &mut object {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        self.managed_objects.insert(id.clone(), object);
        self.external_ids
            .insert((id_type.to_string(), external_id.to_string()), id.clone());
        id
    }

    /// Answer every request for `api` with `status`.
    pub fn fail_api(&self, api: TargetApi, status: u16) {
        self.failures.lock().insert(api, status);
    }

    /// Reject the next `count` external id registrations with a 503.
    pub fn fail_registrations(&self, count: usize) {
        self.registration_failures.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<PlatformRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, api: TargetApi) -> Vec<PlatformRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.api == api)
            .cloned()
            .collect()
    }

    /// Managed objects created through the inventory API.
    pub fn created_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn managed_object(&self, id: &str) -> Option<Value> {
        self.managed_objects.get(id).map(|mo| mo.value().clone())
    }

    pub fn external_id_of(&self, external_id: &str, id_type: &str) -> Option<String> {
        self.external_ids
            .get(&(id_type.to_string(), external_id.to_string()))
            .map(|id| id.value().clone())
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn store_object(&self, mut body: Value) -> Result<(String, Value), ApiError> {
        let Value::Object(map) = &mut body else {
            return Err(ApiError::InvalidRequest("body must be an object".to_string()));
        };
        let id = self.allocate_id();
        map.insert("id".to_string(), Value::String(id.clone()));
        self.managed_objects.insert(id.clone(), body.clone());
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok((id, body))
    }
}

#[async_trait]
impl InventoryApi for InMemoryPlatform {
    async fn get_managed_object(&self, id: &str) -> Result<Option<Value>, ApiError> {
        self.pause().await;
        Ok(self.managed_object(id))
    }

    async fn lookup_external_id(
        &self,
        external_id: &str,
        id_type: &str,
    ) -> Result<Option<String>, ApiError> {
        self.pause().await;
        Ok(self.external_id_of(external_id, id_type))
    }

    async fn reverse_external_ids(&self, global_id: &str) -> Result<Vec<ExternalSource>, ApiError> {
        self.pause().await;
        Ok(self
            .external_ids
            .iter()
            .filter(|entry| entry.value() == global_id)
            .map(|entry| {
                let (id_type, external_id) = entry.key();
                ExternalSource::new(external_id.clone(), id_type.clone())
            })
            .collect())
    }

    async fn create_managed_object(&self, body: Value) -> Result<String, ApiError> {
        self.pause().await;
        self.store_object(body).map(|(id, _)| id)
    }

    async fn register_external_id(
        &self,
        global_id: &str,
        external_id: &str,
        id_type: &str,
    ) -> Result<(), ApiError> {
        self.pause().await;
        let failing = self
            .registration_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ApiError::Status {
                status: 503,
                body: "identity service unavailable".to_string(),
            });
        }
        if !self.managed_objects.contains_key(global_id) {
            return Err(ApiError::NotFound(format!("managed object {}", global_id)));
        }
        self.external_ids.insert(
            (id_type.to_string(), external_id.to_string()),
            global_id.to_string(),
        );
        Ok(())
    }
}

#[async_trait]
impl PlatformApi for InMemoryPlatform {
    async fn send(&self, request: PlatformRequest) -> Result<PlatformResponse, ApiError> {
        self.pause().await;
        self.requests.lock().push(request.clone());

        if let Some(status) = self.failures.lock().get(&request.api).copied() {
            return Ok(PlatformResponse {
                status,
                body: json!({"error": "injected failure"}),
            });
        }

        let response = match (request.api, request.method) {
            (TargetApi::Inventory, HttpMethod::Post) => {
                let (_, body) = self.store_object(request.body)?;
                PlatformResponse { status: 201, body }
            }
            (TargetApi::Inventory, HttpMethod::Put | HttpMethod::Patch) => {
                let id = request
                    .source_id
                    .ok_or_else(|| ApiError::InvalidRequest("update without id".to_string()))?;
                let Some(mut current) = self.managed_objects.get_mut(&id) else {
                    return Ok(PlatformResponse {
                        status: 404,
                        body: json!({"error": format!("managed object {} not found", id)}),
                    });
                };
                if let (Value::Object(target), Value::Object(fields)) = (current.value_mut(), request.body) {
                    target.extend(fields);
                }
                PlatformResponse {
                    status: 200,
                    body: current.value().clone(),
                }
            }
            (TargetApi::Inventory, HttpMethod::Delete) => {
                let removed = request
                    .source_id
                    .and_then(|id| self.managed_objects.remove(&id));
                PlatformResponse {
                    status: if removed.is_some() { 204 } else { 404 },
                    body: Value::Null,
                }
            }
            (_, HttpMethod::Post) => {
                let mut body = request.body;
                if let Value::Object(map) = &mut body {
                    map.insert("id".to_string(), Value::String(self.allocate_id()));
                }
                PlatformResponse { status: 201, body }
            }
            (_, _) => PlatformResponse {
                status: 200,
                body: request.body,
            },
        };
        Ok(response)
    }
}

/// Transport that records published messages.
#[derive(Default)]
pub struct InMemoryTransport {
    published: Mutex<Vec<OutboundMessage>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl OutboundTransport for InMemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), ApiError> {
        self.published.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_round_trip() {
        let platform = InMemoryPlatform::new();
        let id = platform
            .create_managed_object(json!({"name": "berlin_01", "c8y_IsDevice": {}}))
            .await
            .unwrap();
        platform
            .register_external_id(&id, "berlin_01", "c8y_Serial")
            .await
            .unwrap();

        assert_eq!(
            platform.lookup_external_id("berlin_01", "c8y_Serial").await.unwrap(),
            Some(id.clone())
        );
        let reverse = platform.reverse_external_ids(&id).await.unwrap();
        assert_eq!(reverse, vec![ExternalSource::new("berlin_01", "c8y_Serial")]);
        assert_eq!(platform.created_count(), 1);
    }

    #[tokio::test]
    async fn test_register_unknown_object_fails() {
        let platform = InMemoryPlatform::new();
        let err = platform
            .register_external_id("42", "x", "c8y_Serial")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let platform = InMemoryPlatform::new();
        platform.fail_api(TargetApi::Alarm, 503);
        let response = platform
            .send(PlatformRequest::new(TargetApi::Alarm, HttpMethod::Post, json!({})))
            .await
            .unwrap();
        assert!(!response.is_success());
        assert_eq!(platform.requests_for(TargetApi::Alarm).len(), 1);
    }
}
