//! The processing pipeline.
//!
//! A message moves through `Received → Normalized → Substituted |
//! ScriptExecuted → Assembled → Dispatched` and ends `Acked` or `Failed` at
//! the stage where it stopped. Every mapping subscribed to the message's
//! topic processes it concurrently and independently.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use dynmap_core::action::{Destination, DomainAction};
use dynmap_core::config::EngineConfig;
use dynmap_core::diagnostics::{Diagnostics, ProcessingError, ProcessingStage};
use dynmap_core::filter::Filter;
use dynmap_core::mapping::{Mapping, SnoopStatus, TargetApi};
use dynmap_core::path::TargetPath;
use dynmap_sandbox::{
    DeviceLookup, LogLine, SandboxConfig, ScriptInput, SmartFunctionResult, SmartFunctionSandbox,
};
use dynmap_storage::MappingStore;

use crate::api::{InventoryApi, OutboundTransport, PlatformApi};
use crate::assembler;
use crate::dispatch::{DispatchCoordinator, DispatchReceipt};
use crate::identity::{IdentityResolver, InventoryCache};
use crate::normalizer::{normalize, NormalizedMessage, TransportMessage};
use crate::resolver;
use crate::status::{MappingStatus, StatusRegistry};
use crate::warmup::InventoryWarmer;

/// Payload samples kept per mapping while snooping.
pub const MAX_SNOOPED_TEMPLATES: usize = 10;

/// How processing of a message ended for one mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeState {
    /// Every action was delivered.
    Acked,
    /// Processing stopped, or at least one action was not delivered.
    Failed { stage: ProcessingStage },
    /// The mapping filter rejected the message.
    Filtered,
    /// The payload was recorded as a template sample instead of processed.
    Snooped,
    /// Test run: actions were built but not dispatched.
    DryRun,
}

/// Result of processing one message with one mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOutcome {
    pub mapping_id: String,
    pub message_id: String,
    /// Last stage the message reached.
    pub stage: ProcessingStage,
    pub state: OutcomeState,
    pub actions: Vec<DomainAction>,
    pub receipts: Vec<DispatchReceipt>,
    pub diagnostics: Diagnostics,
    pub logs: Vec<LogLine>,
    pub warnings: Vec<String>,
}

impl ProcessingOutcome {
    fn new(mapping_id: &str, message: &TransportMessage) -> Self {
        Self {
            mapping_id: mapping_id.to_string(),
            message_id: message.message_id.clone().unwrap_or_default(),
            stage: ProcessingStage::Received,
            state: OutcomeState::Acked,
            actions: Vec::new(),
            receipts: Vec::new(),
            diagnostics: Diagnostics::new(),
            logs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fail(mut self, error: ProcessingError) -> Self {
        self.state = OutcomeState::Failed { stage: self.stage };
        self.diagnostics.push(&self.mapping_id, &self.message_id, error);
        self
    }

    fn record(&mut self, errors: impl IntoIterator<Item = ProcessingError>) {
        self.diagnostics.extend(&self.mapping_id, &self.message_id, errors);
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, OutcomeState::Failed { .. })
    }

    pub fn dispatched(&self) -> usize {
        self.receipts.iter().filter(|r| r.is_acked()).count()
    }
}

/// Runs messages through their mappings.
pub struct MappingEngine {
    config: EngineConfig,
    mappings: Arc<MappingStore>,
    sandbox: SmartFunctionSandbox,
    identity: Arc<IdentityResolver>,
    objects: Arc<InventoryCache>,
    dispatcher: DispatchCoordinator,
    status: StatusRegistry,
}

impl MappingEngine {
    pub fn new(
        config: EngineConfig,
        mappings: Arc<MappingStore>,
        inventory: Arc<dyn InventoryApi>,
        platform: Arc<dyn PlatformApi>,
    ) -> Self {
        let objects = Arc::new(InventoryCache::new(config.identity.inventory_cache_capacity));
        let warmer = Arc::new(InventoryWarmer::new(objects.clone(), inventory.clone()));
        let identity = Arc::new(
            IdentityResolver::new(inventory, objects.clone(), &config.identity).with_hook(warmer),
        );
        let dispatcher = DispatchCoordinator::new(platform, identity.clone(), &config.dispatch);
        let sandbox = SmartFunctionSandbox::new(
            SandboxConfig::from(config.sandbox.clone()),
            mappings.state(),
        );

        Self {
            config,
            mappings,
            sandbox,
            identity,
            objects,
            dispatcher,
            status: StatusRegistry::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.dispatcher = self.dispatcher.with_transport(transport);
        self
    }

    pub fn with_sink(mut self, destination: Destination, sink: Arc<dyn PlatformApi>) -> Self {
        self.dispatcher = self.dispatcher.with_sink(destination, sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mappings(&self) -> Arc<MappingStore> {
        self.mappings.clone()
    }

    pub fn identity(&self) -> Arc<IdentityResolver> {
        self.identity.clone()
    }

    /// Objects Smart Functions can look up.
    pub fn inventory_cache(&self) -> Arc<InventoryCache> {
        self.objects.clone()
    }

    pub fn status(&self, mapping_id: &str) -> Option<MappingStatus> {
        self.status.get(mapping_id)
    }

    pub fn statuses(&self) -> Vec<MappingStatus> {
        self.status.all()
    }

    /// Delete a mapping with its state, lock and counters.
    pub async fn delete_mapping(&self, mapping_id: &str) -> dynmap_storage::Result<bool> {
        let existed = self.mappings.delete(mapping_id).await?;
        self.sandbox.forget(mapping_id);
        self.status.remove(mapping_id);
        Ok(existed)
    }

    /// Process an inbound message with every mapping subscribed to its topic.
    pub async fn process(&self, message: TransportMessage) -> Vec<ProcessingOutcome> {
        let mappings = self.mappings.resolve_inbound(&message.topic);
        if mappings.is_empty() {
            debug!(topic = %message.topic, "No mapping subscribed to topic");
        }
        join_all(mappings.into_iter().map(|m| self.process_mapping(m, &message))).await
    }

    /// Process a platform object with every outbound mapping of its API.
    pub async fn process_outbound(&self, api: TargetApi, message: TransportMessage) -> Vec<ProcessingOutcome> {
        let mappings = self.mappings.resolve_outbound(api);
        join_all(mappings.into_iter().map(|m| self.process_mapping(m, &message))).await
    }

    /// Process one message with one mapping and update its counters.
    pub async fn process_mapping(&self, mapping: Arc<Mapping>, message: &TransportMessage) -> ProcessingOutcome {
        self.status.record_received(&mapping.id);
        let outcome = self.run(&mapping, message, false).await;

        if outcome.is_failed() {
            let reason = outcome
                .diagnostics
                .iter()
                .last()
                .map(|d| d.error.to_string())
                .unwrap_or_else(|| "failed".to_string());
            let failures = self.status.record_failure(
                &mapping.id,
                outcome.dispatched(),
                outcome.diagnostics.len(),
                reason,
            );
            if mapping.max_failure_count > 0 && failures >= mapping.max_failure_count {
                warn!(mapping = %mapping.id, failures, "Deactivating mapping after repeated failures");
                if let Err(e) = self.mappings.set_active(&mapping.id, false) {
                    warn!(mapping = %mapping.id, error = %e, "Could not deactivate mapping");
                }
            }
        } else {
            self.status
                .record_success(&mapping.id, outcome.dispatched(), outcome.diagnostics.len());
        }
        outcome
    }

    /// Run a message through a mapping without dispatching anything.
    /// Identity is previewed, never created, and script state is untouched.
    pub async fn test(&self, mapping: &Mapping, message: &TransportMessage) -> ProcessingOutcome {
        self.run(mapping, message, true).await
    }

    async fn run(&self, mapping: &Mapping, message: &TransportMessage, dry_run: bool) -> ProcessingOutcome {
        let mut outcome = ProcessingOutcome::new(&mapping.id, message);
        if self.config.log_payload {
            info!(
                mapping = %mapping.id,
                topic = %message.topic,
                payload = %String::from_utf8_lossy(&message.payload),
                "Message received"
            );
        }

        let normalized = match normalize(message, mapping) {
            Ok(normalized) => normalized,
            Err(e) => return outcome.fail(e),
        };
        outcome.message_id = normalized.message_id.clone();
        outcome.stage = ProcessingStage::Normalized;
        outcome.record(normalized.warnings.clone());

        if let Some(expr) = mapping.filter_mapping.as_deref().filter(|f| !f.trim().is_empty()) {
            match Filter::parse(expr) {
                Ok(filter) if !filter.matches(&normalized.document) => {
                    debug!(mapping = %mapping.id, message_id = %outcome.message_id, filter = %filter, "Filtered");
                    outcome.state = OutcomeState::Filtered;
                    return outcome;
                }
                Ok(_) => {}
                Err(e) => return outcome.fail(ProcessingError::resolution(expr, e.to_string())),
            }
        }

        if !dry_run && matches!(mapping.snoop_status, SnoopStatus::Enabled | SnoopStatus::Started) {
            self.snoop(mapping, &normalized);
            outcome.state = OutcomeState::Snooped;
            return outcome;
        }

        let actions = if mapping.transformation_type.is_scripted() {
            match self.execute_script(mapping, &normalized, dry_run).await {
                Ok(result) => {
                    outcome.stage = ProcessingStage::ScriptExecuted;
                    outcome.logs = result.logs;
                    outcome.warnings = result.warnings;
                    result.actions
                }
                Err(e) => return outcome.fail(e),
            }
        } else {
            let skeleton = match mapping.skeleton() {
                Ok(skeleton) => skeleton,
                Err(e) => return outcome.fail(ProcessingError::resolution("targetTemplate", e.to_string())),
            };
            let mut result = resolver::resolve(mapping, &normalized.document, self.config.log_substitution);
            outcome.record(result.take_errors());
            outcome.stage = ProcessingStage::Substituted;

            let assembly = assembler::assemble(&result, mapping, &skeleton, normalized.received_at);
            outcome.record(assembly.errors);
            assembly.actions
        };
        outcome.stage = ProcessingStage::Assembled;

        if dry_run {
            outcome.actions = self.preview_identity(actions).await;
            outcome.state = OutcomeState::DryRun;
            return outcome;
        }

        outcome.actions = actions.clone();
        let receipts = self.dispatcher.dispatch(actions, mapping).await;
        outcome.stage = ProcessingStage::Dispatched;
        outcome.record(receipts.iter().filter_map(|r| r.cause().cloned()).collect::<Vec<_>>());
        outcome.state = if receipts.iter().all(DispatchReceipt::is_acked) {
            OutcomeState::Acked
        } else {
            OutcomeState::Failed {
                stage: ProcessingStage::Dispatched,
            }
        };
        outcome.receipts = receipts;

        debug!(
            mapping = %mapping.id,
            message_id = %outcome.message_id,
            stage = %outcome.stage,
            actions = outcome.actions.len(),
            dispatched = outcome.dispatched(),
            "Message processed"
        );
        outcome
    }

    async fn execute_script(
        &self,
        mapping: &Mapping,
        normalized: &NormalizedMessage,
        dry_run: bool,
    ) -> Result<SmartFunctionResult, ProcessingError> {
        let input = ScriptInput {
            payload: normalized.payload.clone(),
            topic: normalized.topic.clone(),
            client_id: normalized.client_id.clone(),
            message_id: normalized.message_id.clone(),
            transport_fields: normalized.transport_fields(),
        };
        let lookup: Arc<dyn DeviceLookup> = self.objects.clone();
        let result = if dry_run {
            self.sandbox.execute_dry(mapping, &input, lookup).await
        } else {
            self.sandbox.execute(mapping, &input, lookup).await
        };
        result.map_err(|e| ProcessingError::script(e.to_string()))
    }

    /// Fill in platform ids of devices that already exist.
    async fn preview_identity(&self, actions: Vec<DomainAction>) -> Vec<DomainAction> {
        let mut previewed = Vec::with_capacity(actions.len());
        for action in actions {
            let DomainAction::Platform(mut object) = action else {
                previewed.push(action);
                continue;
            };
            if object.source_id.is_none() {
                if let Some(source) = object.external_source.first() {
                    match self.identity.preview(&source.external_id, &source.id_type).await {
                        Ok(Some(found)) => {
                            let api = TargetApi::from(object.cumulocity_type);
                            if let Ok(path) = TargetPath::parse(api.identifier_path()) {
                                path.set(&mut object.payload, Value::String(found.id.clone()), true);
                            }
                            object.source_id = Some(found.id);
                        }
                        Ok(None) => {}
                        Err(e) => debug!(external_id = %source.external_id, error = %e, "Identity preview failed"),
                    }
                }
            }
            previewed.push(DomainAction::Platform(object));
        }
        previewed
    }

    /// Keep the payload as a template sample.
    fn snoop(&self, mapping: &Mapping, normalized: &NormalizedMessage) {
        let mut updated = self
            .mappings
            .get(&mapping.id)
            .map(|current| (*current).clone())
            .unwrap_or_else(|| mapping.clone());
        if updated.snooped_templates.len() < MAX_SNOOPED_TEMPLATES {
            updated.snooped_templates.push(normalized.payload.to_string());
        }
        updated.snoop_status = SnoopStatus::Started;
        match self.mappings.upsert(updated) {
            Ok(stored) => debug!(
                mapping = %stored.id,
                samples = stored.snooped_templates.len(),
                "Snooped payload"
            ),
            Err(e) => warn!(mapping = %mapping.id, error = %e, "Could not store snooped payload"),
        }
    }
}
