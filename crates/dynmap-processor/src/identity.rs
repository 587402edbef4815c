//! Device identity resolution.
//!
//! Maps wire-level device identifiers (external id + type) to platform ids,
//! creating devices on demand. Resolved references are cached; concurrent
//! resolutions of the same identifier share one lookup, so a device is
//! created at most once. A device whose external id could not be registered
//! is remembered, and the next resolution only retries the registration.
//!
//! The resolver reads the [`InventoryCache`] but never writes it. What it
//! learns about devices is reported as a [`Resolution`] to the
//! [`ResolutionHook`] its owner installed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use dynmap_core::config::IdentitySettings;
use dynmap_core::diagnostics::ProcessingError;
use dynmap_sandbox::DeviceLookup;

use crate::api::{ApiError, InventoryApi};

/// Fragment marking devices the mapper created implicitly.
pub const GENERATED_TYPE_FRAGMENT: &str = "d11r_device_generatedType";

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("No device registered for '{external_id}' ({id_type})")]
    NotFound { external_id: String, id_type: String },

    #[error("Managed object '{0}' does not exist")]
    UnknownObject(String),

    #[error("Identity lookup failed: {0}")]
    Api(#[from] ApiError),
}

impl IdentityError {
    pub fn into_processing_error(self, external_id: &str, id_type: &str) -> ProcessingError {
        ProcessingError::Identity {
            external_id: external_id.to_string(),
            id_type: id_type.to_string(),
            reason: self.to_string(),
        }
    }
}

/// A resolved platform object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformRef {
    pub id: String,
}

/// What to resolve, and how to create the device when it is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    pub external_id: String,
    pub id_type: String,
    pub auto_create: bool,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
}

impl IdentityRequest {
    pub fn new(external_id: impl Into<String>, id_type: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            id_type: id_type.into(),
            auto_create: false,
            device_name: None,
            device_type: None,
        }
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    fn key(&self) -> (String, String) {
        (self.external_id.clone(), self.id_type.clone())
    }
}

/// Something the resolver learned about a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// An external id resolved to an existing object.
    Found {
        external_id: String,
        id_type: String,
        id: String,
    },
    /// A device was created and registered; `object` carries its `id`.
    Created {
        external_id: String,
        id_type: String,
        object: Value,
    },
    /// An external id was registered for an object created elsewhere.
    Registered {
        external_id: String,
        id_type: String,
        id: String,
    },
    /// An object was fetched by platform id.
    Fetched(Value),
}

/// Receives every [`Resolution`] of an [`IdentityResolver`].
#[async_trait]
pub trait ResolutionHook: Send + Sync {
    async fn on_resolution(&self, resolution: Resolution);
}

/// Hook that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

#[async_trait]
impl ResolutionHook for NoHook {
    async fn on_resolution(&self, _resolution: Resolution) {}
}

/// Cached view of managed objects, used for script lookups and parent
/// traversal. Lookups never reach the platform.
pub struct InventoryCache {
    objects: moka::sync::Cache<String, Value>,
    external_ids: moka::sync::Cache<(String, String), String>,
}

impl InventoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            objects: moka::sync::Cache::new(capacity),
            external_ids: moka::sync::Cache::new(capacity),
        }
    }

    /// Cache a managed object; objects without an `id` are ignored.
    pub fn insert(&self, object: Value) -> bool {
        let Some(id) = object_id(&object) else {
            return false;
        };
        self.objects.insert(id, object);
        true
    }

    pub fn register(&self, external_id: &str, id_type: &str, id: &str) {
        self.external_ids
            .insert((external_id.to_string(), id_type.to_string()), id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.objects.get(id)
    }

    pub fn invalidate(&self, id: &str) {
        self.objects.invalidate(id);
    }
}

pub(crate) fn object_id(object: &Value) -> Option<String> {
    match object.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl DeviceLookup for InventoryCache {
    fn managed_object(&self, id: &str) -> Option<Value> {
        self.get(id)
    }

    fn by_external_id(&self, external_id: &str, id_type: &str) -> Option<Value> {
        let id = self
            .external_ids
            .get(&(external_id.to_string(), id_type.to_string()))?;
        self.get(&id)
    }

    fn parent(&self, id: &str) -> Option<Value> {
        let object = self.get(id)?;
        let reference = object
            .get("assetParents")?
            .get("references")?
            .as_array()?
            .first()?
            .get("managedObject")?
            .clone();
        match object_id(&reference).and_then(|parent| self.get(&parent)) {
            Some(full) => Some(full),
            None => Some(reference),
        }
    }
}

/// Resolves device identities against the inventory.
pub struct IdentityResolver {
    inventory: Arc<dyn InventoryApi>,
    resolved: Cache<(String, String), PlatformRef>,
    // (globalId, type) -> externalId
    reverse: Cache<(String, String), String>,
    // created devices whose external id is not registered yet
    unregistered: Cache<(String, String), Value>,
    objects: Arc<InventoryCache>,
    hook: Arc<dyn ResolutionHook>,
    implicit_device_type: String,
}

impl IdentityResolver {
    pub fn new(
        inventory: Arc<dyn InventoryApi>,
        objects: Arc<InventoryCache>,
        settings: &IdentitySettings,
    ) -> Self {
        let ttl = Duration::from_secs(settings.cache_ttl_secs);
        Self {
            inventory,
            resolved: Cache::builder()
                .max_capacity(settings.cache_capacity)
                .time_to_live(ttl)
                .build(),
            reverse: Cache::builder()
                .max_capacity(settings.cache_capacity)
                .time_to_live(ttl)
                .build(),
            unregistered: Cache::builder()
                .max_capacity(settings.cache_capacity)
                .time_to_live(ttl)
                .build(),
            objects,
            hook: Arc::new(NoHook),
            implicit_device_type: settings.implicit_device_type.clone(),
        }
    }

    /// Report resolutions to `hook`.
    pub fn with_hook(mut self, hook: Arc<dyn ResolutionHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn inventory_cache(&self) -> Arc<InventoryCache> {
        self.objects.clone()
    }

    /// Resolve an external id, creating the device when allowed.
    pub async fn resolve(&self, request: &IdentityRequest) -> Result<PlatformRef, IdentityError> {
        let key = request.key();
        let first = self
            .resolved
            .try_get_with(key.clone(), self.lookup_or_create(request.clone()))
            .await
            .map_err(|e| (*e).clone());

        match first {
            // A concurrent caller without auto-create may have won the
            // race; try once more with our own request.
            Err(IdentityError::NotFound { .. }) if request.auto_create => self
                .resolved
                .try_get_with(key, self.lookup_or_create(request.clone()))
                .await
                .map_err(|e| (*e).clone()),
            other => other,
        }
    }

    /// Look up without creating or caching a miss. Used by dry runs.
    pub async fn preview(
        &self,
        external_id: &str,
        id_type: &str,
    ) -> Result<Option<PlatformRef>, IdentityError> {
        let key = (external_id.to_string(), id_type.to_string());
        if let Some(found) = self.resolved.get(&key).await {
            return Ok(Some(found));
        }
        Ok(self
            .inventory
            .lookup_external_id(external_id, id_type)
            .await?
            .map(|id| PlatformRef { id }))
    }

    /// Check that an explicit platform id exists.
    pub async fn resolve_by_id(&self, id: &str) -> Result<PlatformRef, IdentityError> {
        if self.objects.get(id).is_some() {
            return Ok(PlatformRef { id: id.to_string() });
        }
        match self.inventory.get_managed_object(id).await? {
            Some(object) => {
                self.hook.on_resolution(Resolution::Fetched(object)).await;
                Ok(PlatformRef { id: id.to_string() })
            }
            None => Err(IdentityError::UnknownObject(id.to_string())),
        }
    }

    /// External id of type `id_type` registered for a platform id.
    pub async fn resolve_external_id(
        &self,
        global_id: &str,
        id_type: &str,
    ) -> Result<Option<String>, IdentityError> {
        let key = (global_id.to_string(), id_type.to_string());
        if let Some(found) = self.reverse.get(&key).await {
            return Ok(Some(found));
        }
        let found = self
            .inventory
            .reverse_external_ids(global_id)
            .await?
            .into_iter()
            .find(|source| source.id_type == id_type)
            .map(|source| source.external_id);
        if let Some(external_id) = &found {
            self.reverse.insert(key, external_id.clone()).await;
        }
        Ok(found)
    }

    /// Parent of a device, from the cached `assetParents` fragment.
    pub fn resolve_parent(&self, device: &PlatformRef) -> Option<PlatformRef> {
        self.objects
            .parent(&device.id)
            .and_then(|parent| object_id(&parent))
            .map(|id| PlatformRef { id })
    }

    /// Register an external id for an object created outside the resolver.
    pub async fn register(
        &self,
        external_id: &str,
        id_type: &str,
        id: &str,
    ) -> Result<(), IdentityError> {
        self.inventory.register_external_id(id, external_id, id_type).await?;
        self.hook
            .on_resolution(Resolution::Registered {
                external_id: external_id.to_string(),
                id_type: id_type.to_string(),
                id: id.to_string(),
            })
            .await;
        self.resolved
            .insert(
                (external_id.to_string(), id_type.to_string()),
                PlatformRef { id: id.to_string() },
            )
            .await;
        Ok(())
    }

    async fn lookup_or_create(&self, request: IdentityRequest) -> Result<PlatformRef, IdentityError> {
        if let Some(id) = self
            .inventory
            .lookup_external_id(&request.external_id, &request.id_type)
            .await?
        {
            debug!(external_id = %request.external_id, id_type = %request.id_type, id = %id, "Resolved device");
            self.hook
                .on_resolution(Resolution::Found {
                    external_id: request.external_id,
                    id_type: request.id_type,
                    id: id.clone(),
                })
                .await;
            return Ok(PlatformRef { id });
        }

        if !request.auto_create {
            return Err(IdentityError::NotFound {
                external_id: request.external_id,
                id_type: request.id_type,
            });
        }

        let key = request.key();
        let created = match self.unregistered.get(&key).await {
            Some(created) => created,
            None => {
                let mut body = self.device_body(&request);
                let id = self.inventory.create_managed_object(body.clone()).await?;
                if let Value::Object(map) = &mut body {
                    map.insert("id".to_string(), Value::String(id.clone()));
                }
                info!(external_id = %request.external_id, id_type = %request.id_type, id = %id, "Created device");
                body
            }
        };
        let id = object_id(&created).unwrap_or_default();

        if let Err(e) = self
            .inventory
            .register_external_id(&id, &request.external_id, &request.id_type)
            .await
        {
            warn!(
                external_id = %request.external_id,
                id_type = %request.id_type,
                id = %id,
                error = %e,
                "External id not registered, retrying with the next message"
            );
            self.unregistered.insert(key, created).await;
            return Err(e.into());
        }
        self.unregistered.invalidate(&key).await;

        self.hook
            .on_resolution(Resolution::Created {
                external_id: request.external_id,
                id_type: request.id_type,
                object: created,
            })
            .await;
        Ok(PlatformRef { id })
    }

    /// Managed object created for an unknown device.
    fn device_body(&self, request: &IdentityRequest) -> Value {
        let name = request
            .device_name
            .clone()
            .unwrap_or_else(|| format!("device_{}_{}", request.id_type, request.external_id));
        let device_type = request
            .device_type
            .clone()
            .unwrap_or_else(|| self.implicit_device_type.clone());
        json!({
            "name": name,
            "type": device_type,
            "c8y_IsDevice": {},
            GENERATED_TYPE_FRAGMENT: {},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatform;
    use crate::warmup::InventoryWarmer;

    fn resolver(platform: Arc<InMemoryPlatform>) -> IdentityResolver {
        let objects = Arc::new(InventoryCache::new(100));
        let warmer = Arc::new(InventoryWarmer::new(objects.clone(), platform.clone()));
        IdentityResolver::new(platform, objects, &IdentitySettings::default()).with_hook(warmer)
    }

    #[tokio::test]
    async fn test_auto_create() {
        let platform = Arc::new(InMemoryPlatform::new());
        let resolver = resolver(platform.clone());

        let missing = resolver
            .resolve(&IdentityRequest::new("berlin_01", "c8y_Serial"))
            .await;
        assert!(matches!(missing, Err(IdentityError::NotFound { .. })));

        let created = resolver
            .resolve(&IdentityRequest::new("berlin_01", "c8y_Serial").auto_create(true))
            .await
            .unwrap();
        let object = platform.managed_object(&created.id).unwrap();
        assert_eq!(object["name"], "device_c8y_Serial_berlin_01");
        assert_eq!(object["type"], "c8y_MQTTDevice");
        assert!(object.get("c8y_IsDevice").is_some());
        assert!(object.get(GENERATED_TYPE_FRAGMENT).is_some());
        assert_eq!(
            platform.external_id_of("berlin_01", "c8y_Serial"),
            Some(created.id.clone())
        );

        // Cached afterwards, and visible to script lookups.
        let again = resolver
            .resolve(&IdentityRequest::new("berlin_01", "c8y_Serial"))
            .await
            .unwrap();
        assert_eq!(again, created);
        assert!(resolver
            .inventory_cache()
            .by_external_id("berlin_01", "c8y_Serial")
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried_without_recreating() {
        let platform = Arc::new(InMemoryPlatform::new());
        let resolver = resolver(platform.clone());
        let request = IdentityRequest::new("berlin_01", "c8y_Serial").auto_create(true);
        platform.fail_registrations(1);

        let first = resolver.resolve(&request).await;
        assert!(matches!(first, Err(IdentityError::Api(ApiError::Status { status: 503, .. }))));
        assert_eq!(platform.created_count(), 1);
        assert_eq!(platform.external_id_of("berlin_01", "c8y_Serial"), None);

        let second = resolver.resolve(&request).await.unwrap();
        assert_eq!(platform.created_count(), 1);
        assert_eq!(
            platform.external_id_of("berlin_01", "c8y_Serial"),
            Some(second.id.clone())
        );
        assert!(platform.managed_object(&second.id).is_some());
    }

    struct Recorder(parking_lot::Mutex<Vec<Resolution>>);

    #[async_trait]
    impl ResolutionHook for Recorder {
        async fn on_resolution(&self, resolution: Resolution) {
            self.0.lock().push(resolution);
        }
    }

    #[tokio::test]
    async fn test_cache_is_only_filled_through_the_hook() {
        let platform = Arc::new(InMemoryPlatform::new());
        let known = platform.add_device("known", "c8y_Serial", json!({"name": "known"}));
        let objects = Arc::new(InventoryCache::new(100));
        let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
        let resolver = IdentityResolver::new(platform, objects.clone(), &IdentitySettings::default())
            .with_hook(recorder.clone());

        resolver
            .resolve(&IdentityRequest::new("known", "c8y_Serial"))
            .await
            .unwrap();
        let created = resolver
            .resolve(&IdentityRequest::new("fresh", "c8y_Serial").auto_create(true))
            .await
            .unwrap();

        assert!(objects.get(&known).is_none());
        assert!(objects.by_external_id("fresh", "c8y_Serial").is_none());

        let seen = recorder.0.lock().clone();
        assert_eq!(
            seen[0],
            Resolution::Found {
                external_id: "known".to_string(),
                id_type: "c8y_Serial".to_string(),
                id: known,
            }
        );
        match &seen[1] {
            Resolution::Created { external_id, object, .. } => {
                assert_eq!(external_id, "fresh");
                assert_eq!(object["id"], json!(created.id));
            }
            other => panic!("unexpected resolution {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_name_and_type_overrides() {
        let platform = Arc::new(InMemoryPlatform::new());
        let resolver = resolver(platform.clone());
        let mut request = IdentityRequest::new("x-1", "c8y_Serial").auto_create(true);
        request.device_name = Some("Pump 1".to_string());
        request.device_type = Some("pump".to_string());

        let created = resolver.resolve(&request).await.unwrap();
        let object = platform.managed_object(&created.id).unwrap();
        assert_eq!(object["name"], "Pump 1");
        assert_eq!(object["type"], "pump");
    }

    #[tokio::test]
    async fn test_reverse_and_parent() {
        let platform = Arc::new(InMemoryPlatform::new());
        let parent = platform.add_device("plant", "c8y_Serial", json!({"name": "plant"}));
        let child = platform.add_device(
            "berlin_01",
            "c8y_Serial",
            json!({
                "name": "berlin_01",
                "assetParents": {"references": [{"managedObject": {"id": parent.clone()}}]}
            }),
        );
        let resolver = resolver(platform.clone());

        assert_eq!(
            resolver.resolve_external_id(&child, "c8y_Serial").await.unwrap(),
            Some("berlin_01".to_string())
        );
        assert_eq!(resolver.resolve_external_id(&child, "other").await.unwrap(), None);

        let device = resolver.resolve_by_id(&child).await.unwrap();
        assert_eq!(
            resolver.resolve_parent(&device),
            Some(PlatformRef { id: parent.clone() })
        );
        assert!(matches!(
            resolver.resolve_by_id("nope").await,
            Err(IdentityError::UnknownObject(_))
        ));
    }

    #[tokio::test]
    async fn test_preview_never_creates() {
        let platform = Arc::new(InMemoryPlatform::new());
        let resolver = resolver(platform.clone());
        assert_eq!(resolver.preview("ghost", "c8y_Serial").await.unwrap(), None);
        assert_eq!(platform.created_count(), 0);
    }
}
