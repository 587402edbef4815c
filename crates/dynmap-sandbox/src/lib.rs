//! JavaScript sandbox for Smart Functions.
//!
//! A Smart Function is user code defining `onMessage(msg, context)`. Every
//! invocation runs in a fresh Boa context on its own thread, bounded by a
//! loop-iteration limit, a recursion limit and a wall-clock budget. The only capabilities a
//! script sees are the message, its mapping's state, the mapping config,
//! read-only device lookups and `console`.
//!
//! Per-mapping state is loaded before a run and written back only after a
//! successful one. The load, execute and save sequence is serialized per
//! mapping, so invocation `i + 1` always observes the state written by `i`.
//!
//! Boa cannot be interrupted from outside. When the wall-clock budget runs
//! out the caller gets [`SandboxError::Timeout`] at once, but the script
//! thread keeps running until the loop limit stops it or the script returns.
//! Such a thread never persists state, every host call it makes after the
//! deadline throws, and it keeps its slot of `max_concurrent_scripts` until it
//! exits, so abandoned runs cannot pile up without bound.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};

use dynmap_core::action::DomainAction;
use dynmap_core::config::SandboxSettings;
use dynmap_core::mapping::Mapping;
use dynmap_core::topic;
use dynmap_storage::StateStore;

pub mod host_api;
mod runtime;

pub use host_api::{DeviceLookup, NoDevices};
pub use runtime::LogLine;

use runtime::{RawOutcome, RunError, ScriptRun};

/// Errors that can occur in the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The mapping has no code.
    #[error("Mapping '{0}' has no Smart Function code")]
    NoCode(String),

    /// The script threw, failed to parse or returned something unusable.
    #[error("Smart Function of mapping '{mapping}' failed: {message}")]
    Script { mapping: String, message: String },

    /// The script exceeded its time or loop budget.
    #[error("Smart Function of mapping '{mapping}' exceeded its budget of {budget_ms} ms")]
    Timeout { mapping: String, budget_ms: u64 },

    /// State could not be loaded or saved.
    #[error("State error: {0}")]
    State(#[from] dynmap_storage::Error),

    /// The blocking task running the script died.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Mapping definition error.
    #[error(transparent)]
    Mapping(#[from] dynmap_core::Error),
}

/// Configuration for the Smart Function sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget per invocation.
    pub timeout: Duration,

    /// Iterations a single loop may run.
    pub loop_iteration_limit: u64,

    /// Nested calls a script may make.
    pub recursion_limit: usize,

    /// Script threads alive at once, abandoned ones included.
    pub max_concurrent_scripts: usize,

    /// Native stack size of a script thread.
    pub stack_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxSettings::default().into()
    }
}

impl From<SandboxSettings> for SandboxConfig {
    fn from(settings: SandboxSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            loop_iteration_limit: settings.loop_iteration_limit,
            recursion_limit: settings.recursion_limit,
            max_concurrent_scripts: settings.max_concurrent_scripts.max(1),
            stack_size: settings.stack_size_bytes,
        }
    }
}

/// The message as a script sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInput {
    pub payload: Value,
    pub topic: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub message_id: String,
    #[serde(default)]
    pub transport_fields: BTreeMap<String, String>,
}

impl ScriptInput {
    fn to_json(&self) -> Value {
        json!({
            "payload": self.payload,
            "topic": self.topic,
            "topicLevels": topic::split_levels(&self.topic),
            "clientId": self.client_id,
            "messageId": self.message_id,
            "transportFields": self.transport_fields,
        })
    }
}

/// Result of one Smart Function invocation.
#[derive(Debug, Clone, Default)]
pub struct SmartFunctionResult {
    pub actions: Vec<DomainAction>,
    pub logs: Vec<LogLine>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

/// Runs Smart Functions.
pub struct SmartFunctionSandbox {
    config: SandboxConfig,
    state: Arc<dyn StateStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    threads: Arc<Semaphore>,
}

impl SmartFunctionSandbox {
    pub fn new(config: SandboxConfig, state: Arc<dyn StateStore>) -> Self {
        let threads = Arc::new(Semaphore::new(config.max_concurrent_scripts.max(1)));
        Self {
            config,
            state,
            locks: DashMap::new(),
            threads,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.state.clone()
    }

    fn lock_for(&self, mapping_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(mapping_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-mapping lock of a deleted mapping.
    pub fn forget(&self, mapping_id: &str) {
        self.locks.remove(mapping_id);
    }

    /// Run the mapping's Smart Function and persist state on success.
    pub async fn execute(
        &self,
        mapping: &Mapping,
        input: &ScriptInput,
        lookup: Arc<dyn DeviceLookup>,
    ) -> Result<SmartFunctionResult, SandboxError> {
        self.invoke(mapping, input, lookup, true).await
    }

    /// Run the Smart Function without writing state back.
    pub async fn execute_dry(
        &self,
        mapping: &Mapping,
        input: &ScriptInput,
        lookup: Arc<dyn DeviceLookup>,
    ) -> Result<SmartFunctionResult, SandboxError> {
        self.invoke(mapping, input, lookup, false).await
    }

    async fn invoke(
        &self,
        mapping: &Mapping,
        input: &ScriptInput,
        lookup: Arc<dyn DeviceLookup>,
        persist: bool,
    ) -> Result<SmartFunctionResult, SandboxError> {
        let source = mapping
            .decoded_code()?
            .ok_or_else(|| SandboxError::NoCode(mapping.id.clone()))?;

        let lock = self.lock_for(&mapping.id);
        let _held = lock.lock().await;

        let state = self.state.load(&mapping.id).await?;
        let started = Instant::now();
        let script = ScriptRun {
            source,
            input: input.to_json(),
            config: mapping_config(mapping),
            state,
            loop_iteration_limit: self.config.loop_iteration_limit,
            recursion_limit: self.config.recursion_limit,
            deadline: started.checked_add(self.config.timeout),
            lookup,
        };

        let outcome = match tokio::time::timeout(self.config.timeout, self.spawn(script)).await {
            Err(_) => return Err(self.timeout(mapping)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Err(RunError::LimitExceeded))) => return Err(self.timeout(mapping)),
            Ok(Ok(Err(RunError::Engine(message)))) => {
                return Err(SandboxError::Script {
                    mapping: mapping.id.clone(),
                    message,
                })
            }
            Ok(Ok(Ok(outcome))) => outcome,
        };
        let elapsed = started.elapsed();

        for line in &outcome.logs {
            match line.level.as_str() {
                "error" | "warn" => warn!(mapping = %mapping.id, "{}", line.message),
                "debug" => debug!(mapping = %mapping.id, "{}", line.message),
                _ if mapping.debug => info!(mapping = %mapping.id, "{}", line.message),
                _ => debug!(mapping = %mapping.id, "{}", line.message),
            }
        }

        if let Some(message) = outcome.error {
            return Err(SandboxError::Script {
                mapping: mapping.id.clone(),
                message,
            });
        }

        let actions = outcome
            .actions
            .into_iter()
            .map(DomainAction::from_script_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|message| SandboxError::Script {
                mapping: mapping.id.clone(),
                message,
            })?;

        if persist {
            self.state.save(&mapping.id, &outcome.state).await?;
        }

        debug!(
            mapping = %mapping.id,
            message_id = %input.message_id,
            actions = actions.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Smart Function executed"
        );

        Ok(SmartFunctionResult {
            actions,
            logs: outcome.logs,
            warnings: outcome.warnings,
            elapsed,
        })
    }

    /// Run `script` on a dedicated thread once a script slot is free. The
    /// slot stays taken until the thread exits, also when nobody waits for
    /// the result any more.
    async fn spawn(&self, script: ScriptRun) -> Result<Result<RawOutcome, RunError>, SandboxError> {
        let permit = self
            .threads
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("smart-function".to_string())
            .stack_size(self.config.stack_size)
            .spawn(move || {
                let result = runtime::run(script);
                drop(permit);
                let _ = tx.send(result);
            })
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        rx.await
            .map_err(|_| SandboxError::Runtime("script thread terminated".to_string()))
    }

    fn timeout(&self, mapping: &Mapping) -> SandboxError {
        SandboxError::Timeout {
            mapping: mapping.id.clone(),
            budget_ms: self.config.timeout.as_millis() as u64,
        }
    }
}

/// What `context.getConfig()` returns.
fn mapping_config(mapping: &Mapping) -> Value {
    json!({
        "mappingId": mapping.id,
        "identifier": mapping.identifier,
        "name": mapping.name,
        "direction": mapping.direction,
        "targetAPI": mapping.target_api,
        "mappingTopic": mapping.mapping_topic,
        "publishTopic": mapping.publish_topic,
        "externalIdType": mapping.external_id_type,
        "createNonExistingDevice": mapping.create_non_existing_device,
        "debug": mapping.debug,
    })
}
