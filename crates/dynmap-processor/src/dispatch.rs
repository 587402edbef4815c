//! Action dispatch.
//!
//! Every action of a message is delivered independently on a bounded worker
//! pool: platform objects go to the sink selected by their destination,
//! device messages to the outbound transport. One failing action never
//! blocks its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use dynmap_core::action::{
    ActionKind, CumulocityObject, Destination, DeviceMessage, DomainAction, HttpMethod,
};
use dynmap_core::config::{BackpressurePolicy, DispatchSettings};
use dynmap_core::diagnostics::{ProcessingError, ProcessingStage};
use dynmap_core::mapping::{Mapping, TargetApi};
use dynmap_core::path::TargetPath;
use dynmap_core::substitution::tokens;
use dynmap_core::topic;

use crate::api::{
    ApiError, Attachment, OutboundMessage, OutboundTransport, PlatformApi, PlatformRequest,
};
use crate::identity::{IdentityError, IdentityRequest, IdentityResolver};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Every worker was busy and the policy is `reject`.
    #[error("Dispatch pool saturated")]
    Saturated,

    #[error("No sink registered for destination {0:?}")]
    NoSink(Destination),

    #[error("No outbound transport configured")]
    NoTransport,

    #[error("Platform rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Action has no device identity")]
    NoIdentity,

    #[error("Device '{0}' already exists and updateExistingDevice is off")]
    DeviceExists(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl DispatchError {
    fn into_processing_error(self, action: &DomainAction) -> ProcessingError {
        match self {
            DispatchError::Identity(e) => {
                let (external_id, id_type) = action
                    .external_source()
                    .first()
                    .map(|s| (s.external_id.as_str(), s.id_type.as_str()))
                    .unwrap_or(("", ""));
                e.into_processing_error(external_id, id_type)
            }
            other => ProcessingError::dispatch(other.to_string()),
        }
    }
}

/// Delivery outcome of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Acked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
    Failed {
        stage: ProcessingStage,
        cause: ProcessingError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    /// Position of the action in the message's action list.
    pub index: usize,
    #[serde(flatten)]
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

impl DispatchReceipt {
    pub fn is_acked(&self) -> bool {
        matches!(self.status, DispatchStatus::Acked { .. })
    }

    pub fn cause(&self) -> Option<&ProcessingError> {
        match &self.status {
            DispatchStatus::Failed { cause, .. } => Some(cause),
            DispatchStatus::Acked { .. } => None,
        }
    }
}

/// Routes actions to platform sinks and the outbound transport.
pub struct DispatchCoordinator {
    sinks: HashMap<Destination, Arc<dyn PlatformApi>>,
    transport: Option<Arc<dyn OutboundTransport>>,
    identity: Arc<IdentityResolver>,
    permits: Arc<Semaphore>,
    policy: BackpressurePolicy,
}

impl DispatchCoordinator {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        identity: Arc<IdentityResolver>,
        settings: &DispatchSettings,
    ) -> Self {
        let mut sinks = HashMap::new();
        sinks.insert(Destination::Cumulocity, platform);
        Self {
            sinks,
            transport: None,
            identity,
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            policy: settings.backpressure,
        }
    }

    /// Route objects with `destination` to `sink`.
    pub fn with_sink(mut self, destination: Destination, sink: Arc<dyn PlatformApi>) -> Self {
        self.sinks.insert(destination, sink);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Deliver all actions concurrently; receipts keep the action order.
    pub async fn dispatch(&self, actions: Vec<DomainAction>, mapping: &Mapping) -> Vec<DispatchReceipt> {
        join_all(
            actions
                .into_iter()
                .enumerate()
                .map(|(index, action)| self.dispatch_one(index, action, mapping)),
        )
        .await
    }

    async fn dispatch_one(&self, index: usize, action: DomainAction, mapping: &Mapping) -> DispatchReceipt {
        let delivered = match self.acquire().await {
            Ok(_permit) => match &action {
                DomainAction::Platform(object) => self.send_platform(object.clone(), mapping).await,
                DomainAction::Device(message) => self.publish_device(message.clone(), mapping).await,
            },
            Err(e) => Err(e),
        };

        match delivered {
            Ok((code, source_id)) => {
                debug!(mapping = %mapping.id, index, code = ?code, "Action delivered");
                DispatchReceipt {
                    index,
                    status: DispatchStatus::Acked { code },
                    source_id,
                }
            }
            Err(e) => {
                warn!(mapping = %mapping.id, index, error = %e, "Action failed");
                let source_id = action.source_id().map(str::to_string);
                let cause = e.into_processing_error(&action);
                DispatchReceipt {
                    index,
                    status: DispatchStatus::Failed {
                        stage: ProcessingStage::Dispatched,
                        cause,
                    },
                    source_id,
                }
            }
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        match self.policy {
            BackpressurePolicy::Reject => self
                .permits
                .clone()
                .try_acquire_owned()
                .map_err(|_| DispatchError::Saturated),
            BackpressurePolicy::Queue => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| DispatchError::Saturated),
        }
    }

    async fn send_platform(
        &self,
        mut object: CumulocityObject,
        mapping: &Mapping,
    ) -> Result<(Option<u16>, Option<String>), DispatchError> {
        let destination = object.destination.unwrap_or_default();
        let sink = self
            .sinks
            .get(&destination)
            .cloned()
            .ok_or(DispatchError::NoSink(destination))?;

        let api = object
            .context_data
            .get(tokens::CTX_API)
            .and_then(|name| TargetApi::from_name(name))
            .unwrap_or_else(|| TargetApi::from(object.cumulocity_type));
        let mut method = object
            .context_data
            .get(tokens::CTX_METHOD)
            .and_then(|m| m.parse::<HttpMethod>().ok())
            .unwrap_or_else(|| object.action.method());

        let source_id = if api == TargetApi::Inventory && object.action == ActionKind::Create {
            self.prepare_device_upsert(&object, mapping, &mut method).await?
        } else {
            Some(self.source_id(&object, mapping).await?)
        };

        if let Some(id) = &source_id {
            if let Ok(path) = TargetPath::parse(api.identifier_path()) {
                path.set(&mut object.payload, Value::String(id.clone()), true);
            }
        }

        let mut request = PlatformRequest::new(api, method, object.payload);
        request.source_id = source_id.clone();
        request.processing_mode = object.context_data.get(tokens::CTX_PROCESSING_MODE).cloned();
        request.attachment = attachment(&object.context_data);

        let response = sink.send(request).await?;
        if !response.is_success() {
            return Err(DispatchError::Rejected {
                status: response.status,
            });
        }

        // A device created through the inventory API gets its external id.
        if api == TargetApi::Inventory && method == HttpMethod::Post {
            if let (Some(id), Some(source)) = (response.object_id(), object.external_source.first()) {
                self.identity
                    .register(&source.external_id, &source.id_type, &id)
                    .await?;
                return Ok((Some(response.status), Some(id)));
            }
        }
        Ok((Some(response.status), source_id))
    }

    /// Platform id of the device an object belongs to. An explicit
    /// `sourceId` wins over external ids.
    async fn source_id(&self, object: &CumulocityObject, mapping: &Mapping) -> Result<String, DispatchError> {
        if let Some(id) = &object.source_id {
            return Ok(id.clone());
        }
        let source = object.external_source.first().ok_or(DispatchError::NoIdentity)?;
        let mut request = IdentityRequest::new(&source.external_id, &source.id_type)
            .auto_create(
                source
                    .auto_create_device_mo
                    .unwrap_or(mapping.create_non_existing_device),
            );
        request.device_name = object.context_data.get(tokens::CTX_DEVICE_NAME).cloned();
        request.device_type = object.context_data.get(tokens::CTX_DEVICE_TYPE).cloned();
        Ok(self.identity.resolve(&request).await?.id)
    }

    /// Inventory creates become updates of an existing device when the
    /// mapping allows it. Returns the id to update, `None` for a create.
    async fn prepare_device_upsert(
        &self,
        object: &CumulocityObject,
        mapping: &Mapping,
        method: &mut HttpMethod,
    ) -> Result<Option<String>, DispatchError> {
        let existing = match (&object.source_id, object.external_source.first()) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(source)) => match self
                .identity
                .resolve(&IdentityRequest::new(&source.external_id, &source.id_type))
                .await
            {
                Ok(found) => Some(found.id),
                Err(IdentityError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            },
            (None, None) => None,
        };

        match existing {
            Some(id) if mapping.update_existing_device => {
                *method = HttpMethod::Put;
                Ok(Some(id))
            }
            Some(id) => Err(DispatchError::DeviceExists(id)),
            None => {
                *method = HttpMethod::Post;
                Ok(None)
            }
        }
    }

    async fn publish_device(
        &self,
        message: DeviceMessage,
        mapping: &Mapping,
    ) -> Result<(Option<u16>, Option<String>), DispatchError> {
        let transport = self.transport.clone().ok_or(DispatchError::NoTransport)?;

        let mut topic_name = message.topic.clone();
        if has_wildcard(&topic_name) {
            let external_id = self.external_id(&message).await?;
            topic_name = topic::render_publish_topic(&topic_name, external_id.as_deref());
        }

        transport
            .publish(OutboundMessage {
                topic: topic_name,
                payload: message.payload_bytes(),
                qos: mapping.qos,
                retain: message.retain,
                transport_fields: message.transport_fields.clone(),
            })
            .await?;
        Ok((None, message.source_id))
    }

    /// External id for rendering an outbound topic.
    async fn external_id(&self, message: &DeviceMessage) -> Result<Option<String>, DispatchError> {
        if let Some(source) = message
            .external_source
            .iter()
            .find(|s| !s.external_id.is_empty())
        {
            return Ok(Some(source.external_id.clone()));
        }
        let (Some(source_id), Some(source)) = (&message.source_id, message.external_source.first()) else {
            return Ok(None);
        };
        Ok(self
            .identity
            .resolve_external_id(source_id, &source.id_type)
            .await?)
    }
}

fn has_wildcard(topic_name: &str) -> bool {
    topic_name
        .split('/')
        .any(|level| level == topic::SINGLE_LEVEL || level == topic::MULTI_LEVEL)
}

/// `attachment_name`, `attachment_type` and `attachment_data` context keys.
fn attachment(context: &std::collections::BTreeMap<String, String>) -> Option<Attachment> {
    let field = |name: &str| context.get(&format!("{}{}", tokens::CTX_ATTACHMENT_PREFIX, name));
    let data = field("data")?;
    Some(Attachment {
        name: field("name").cloned().unwrap_or_else(|| "attachment".to_string()),
        content_type: field("type")
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        data: data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InventoryCache;
    use crate::memory::{InMemoryPlatform, InMemoryTransport};
    use dynmap_core::action::{CumulocityType, ExternalSource};
    use dynmap_core::config::IdentitySettings;
    use dynmap_core::mapping::Direction;
    use serde_json::json;

    fn coordinator(platform: Arc<InMemoryPlatform>, settings: DispatchSettings) -> DispatchCoordinator {
        let identity = Arc::new(IdentityResolver::new(
            platform.clone(),
            Arc::new(InventoryCache::new(100)),
            &IdentitySettings::default(),
        ));
        DispatchCoordinator::new(platform, identity, &settings)
    }

    fn measurement(external_id: &str) -> DomainAction {
        let mut object = CumulocityObject::new(
            CumulocityType::Measurement,
            json!({"source": {"id": ""}, "type": "c8y_T"}),
        );
        object.external_source = vec![ExternalSource::new(external_id, "c8y_Serial")];
        DomainAction::Platform(object)
    }

    #[tokio::test]
    async fn test_failure_does_not_block_siblings() {
        let platform = Arc::new(InMemoryPlatform::new());
        let known = platform.add_device("known", "c8y_Serial", json!({"name": "known"}));
        let dispatcher = coordinator(platform.clone(), DispatchSettings::default());
        let mapping = Mapping::new("m", "t/+", TargetApi::Measurement);

        let receipts = dispatcher
            .dispatch(vec![measurement("unknown"), measurement("known")], &mapping)
            .await;

        assert_eq!(receipts.len(), 2);
        assert!(matches!(receipts[0].cause(), Some(ProcessingError::Identity { .. })));
        assert!(receipts[1].is_acked());
        assert_eq!(receipts[1].source_id.as_deref(), Some(known.as_str()));

        let sent = platform.requests_for(TargetApi::Measurement);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].body["source"]["id"], json!(known));
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_failure() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_device("known", "c8y_Serial", json!({}));
        platform.fail_api(TargetApi::Measurement, 422);
        let dispatcher = coordinator(platform, DispatchSettings::default());

        let receipts = dispatcher
            .dispatch(vec![measurement("known")], &Mapping::new("m", "t/+", TargetApi::Measurement))
            .await;
        assert!(matches!(receipts[0].cause(), Some(ProcessingError::Dispatch { .. })));
    }

    #[tokio::test]
    async fn test_reject_policy_when_saturated() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_device("known", "c8y_Serial", json!({}));
        let dispatcher = coordinator(
            platform,
            DispatchSettings {
                workers: 1,
                backpressure: BackpressurePolicy::Reject,
            },
        );

        let _busy = dispatcher.permits.clone().try_acquire_owned().unwrap();
        let receipts = dispatcher
            .dispatch(vec![measurement("known")], &Mapping::new("m", "t/+", TargetApi::Measurement))
            .await;
        match receipts[0].cause() {
            Some(ProcessingError::Dispatch { reason }) => assert!(reason.contains("saturated")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inventory_upsert() {
        let platform = Arc::new(InMemoryPlatform::new());
        let dispatcher = coordinator(platform.clone(), DispatchSettings::default());
        let mut mapping = Mapping::new("inv", "t/+", TargetApi::Inventory);
        mapping.update_existing_device = true;

        let mut object = CumulocityObject::new(CumulocityType::ManagedObject, json!({"name": "pump"}));
        object.external_source = vec![ExternalSource::new("pump-1", "c8y_Serial")];
        let action = DomainAction::Platform(object);

        let first = dispatcher.dispatch(vec![action.clone()], &mapping).await;
        assert!(first[0].is_acked());
        let id = first[0].source_id.clone().unwrap();
        assert_eq!(platform.external_id_of("pump-1", "c8y_Serial"), Some(id.clone()));

        let second = dispatcher.dispatch(vec![action], &mapping).await;
        assert!(second[0].is_acked());
        let methods: Vec<HttpMethod> = platform
            .requests_for(TargetApi::Inventory)
            .iter()
            .map(|r| r.method)
            .collect();
        assert_eq!(methods, vec![HttpMethod::Post, HttpMethod::Put]);
        assert_eq!(platform.requests_for(TargetApi::Inventory)[1].source_id, Some(id));
    }

    #[tokio::test]
    async fn test_outbound_topic_uses_reverse_lookup() {
        let platform = Arc::new(InMemoryPlatform::new());
        let id = platform.add_device("berlin_01", "c8y_Serial", json!({}));
        let transport = Arc::new(InMemoryTransport::new());
        let dispatcher =
            coordinator(platform, DispatchSettings::default()).with_transport(transport.clone());

        let mut mapping = Mapping::new("out", "ops", TargetApi::Operation);
        mapping.direction = Direction::Outbound;
        mapping.publish_topic = "cmd/+".to_string();

        let message = DeviceMessage {
            payload: json!("restart"),
            topic: "cmd/+".to_string(),
            client_id: None,
            retain: false,
            transport_fields: Default::default(),
            external_source: vec![ExternalSource::new("", "c8y_Serial")],
            action: ActionKind::Create,
            cumulocity_type: Some(CumulocityType::Operation),
            source_id: Some(id),
        };
        let receipts = dispatcher
            .dispatch(vec![DomainAction::Device(message)], &mapping)
            .await;
        assert!(receipts[0].is_acked());

        let published = transport.published();
        assert_eq!(published[0].topic, "cmd/berlin_01");
        assert_eq!(published[0].payload, b"restart".to_vec());
    }
}
