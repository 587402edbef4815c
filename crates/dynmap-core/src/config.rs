//! Engine configuration.
//!
//! Defaults live in [`defaults`], environment overrides in [`env_vars`]. A
//! TOML file can be layered on top with [`EngineConfig::from_toml_file`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default values.
pub mod defaults {
    /// Wall-clock budget for one Smart Function invocation.
    pub const SCRIPT_TIMEOUT_MS: u64 = 250;
    /// Loop iterations a script may run before it is cancelled.
    pub const SCRIPT_LOOP_LIMIT: u64 = 1_000_000;
    /// Nested calls a script may make.
    pub const SCRIPT_RECURSION_LIMIT: usize = 128;
    /// Script threads alive at the same time, including abandoned ones.
    pub const SCRIPT_THREADS: usize = 8;
    /// Native stack of a script thread.
    pub const SCRIPT_STACK_BYTES: usize = 16 * 1024 * 1024;
    /// Concurrent dispatch calls against the platform.
    pub const DISPATCH_WORKERS: usize = 16;
    /// Identity cache capacity (entries).
    pub const IDENTITY_CACHE_CAPACITY: u64 = 10_000;
    /// Identity cache time-to-live.
    pub const IDENTITY_CACHE_TTL_SECS: u64 = 3600;
    /// Inventory cache capacity (entries).
    pub const INVENTORY_CACHE_CAPACITY: u64 = 10_000;
    /// Device type used for implicitly created devices.
    pub const IMPLICIT_DEVICE_TYPE: &str = "c8y_MQTTDevice";
    /// Bytes of a raw payload kept in parse diagnostics.
    pub const RAW_SAMPLE_BYTES: usize = 256;
}

/// Environment variable names.
pub mod env_vars {
    use super::defaults;

    pub const SCRIPT_TIMEOUT_MS: &str = "DYNMAP_SCRIPT_TIMEOUT_MS";
    pub const SCRIPT_LOOP_LIMIT: &str = "DYNMAP_SCRIPT_LOOP_LIMIT";
    pub const DISPATCH_WORKERS: &str = "DYNMAP_DISPATCH_WORKERS";
    pub const BACKPRESSURE: &str = "DYNMAP_BACKPRESSURE";
    pub const LOG_PAYLOAD: &str = "DYNMAP_LOG_PAYLOAD";
    pub const LOG_JSON: &str = "DYNMAP_LOG_JSON";

    /// Script timeout from the environment, or the default.
    pub fn script_timeout_ms() -> u64 {
        std::env::var(SCRIPT_TIMEOUT_MS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::SCRIPT_TIMEOUT_MS)
    }

    /// Script loop limit from the environment, or the default.
    pub fn script_loop_limit() -> u64 {
        std::env::var(SCRIPT_LOOP_LIMIT)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults::SCRIPT_LOOP_LIMIT)
    }

    /// Dispatch worker count from the environment, or the default.
    pub fn dispatch_workers() -> usize {
        std::env::var(DISPATCH_WORKERS)
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults::DISPATCH_WORKERS)
    }

    /// Whether payloads should be logged.
    pub fn log_payload() -> bool {
        std::env::var(LOG_PAYLOAD)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false)
    }
}

/// What the dispatcher does when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for a free worker.
    #[default]
    Queue,
    /// Fail the action immediately.
    Reject,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown backpressure policy '{}'", other)),
        }
    }
}

/// Smart Function execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub timeout_ms: u64,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub max_concurrent_scripts: usize,
    pub stack_size_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::SCRIPT_TIMEOUT_MS,
            loop_iteration_limit: defaults::SCRIPT_LOOP_LIMIT,
            recursion_limit: defaults::SCRIPT_RECURSION_LIMIT,
            max_concurrent_scripts: defaults::SCRIPT_THREADS,
            stack_size_bytes: defaults::SCRIPT_STACK_BYTES,
        }
    }
}

impl SandboxSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Dispatch pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub workers: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: defaults::DISPATCH_WORKERS,
            backpressure: BackpressurePolicy::Queue,
        }
    }
}

/// Identity and inventory cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub cache_capacity: u64,
    pub cache_ttl_secs: u64,
    pub inventory_cache_capacity: u64,
    pub implicit_device_type: String,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            cache_capacity: defaults::IDENTITY_CACHE_CAPACITY,
            cache_ttl_secs: defaults::IDENTITY_CACHE_TTL_SECS,
            inventory_cache_capacity: defaults::INVENTORY_CACHE_CAPACITY,
            implicit_device_type: defaults::IMPLICIT_DEVICE_TYPE.to_string(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox: SandboxSettings,
    pub dispatch: DispatchSettings,
    pub identity: IdentitySettings,
    /// Log every incoming payload at info level.
    pub log_payload: bool,
    /// Log every evaluated substitution at debug level.
    pub log_substitution: bool,
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load a TOML file; missing keys fall back to defaults, then the
    /// environment is applied on top.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text).map(Self::with_env_overrides)
    }

    /// Parse TOML text without touching the environment.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if std::env::var(env_vars::SCRIPT_TIMEOUT_MS).is_ok() {
            self.sandbox.timeout_ms = env_vars::script_timeout_ms();
        }
        if std::env::var(env_vars::SCRIPT_LOOP_LIMIT).is_ok() {
            self.sandbox.loop_iteration_limit = env_vars::script_loop_limit();
        }
        if std::env::var(env_vars::DISPATCH_WORKERS).is_ok() {
            self.dispatch.workers = env_vars::dispatch_workers();
        }
        if let Some(policy) = std::env::var(env_vars::BACKPRESSURE)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.dispatch.backpressure = policy;
        }
        if env_vars::log_payload() {
            self.log_payload = true;
        }
        self
    }
}
