//! Per-mapping processing counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingStatus {
    pub mapping_id: String,
    pub messages_received: u64,
    pub errors: u64,
    pub actions_dispatched: u64,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Counters of all mappings, updated concurrently by the engine.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    entries: DashMap<String, MappingStatus>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<R>(&self, mapping_id: &str, f: impl FnOnce(&mut MappingStatus) -> R) -> R {
        let mut entry = self
            .entries
            .entry(mapping_id.to_string())
            .or_insert_with(|| MappingStatus {
                mapping_id: mapping_id.to_string(),
                ..Default::default()
            });
        f(entry.value_mut())
    }

    pub fn record_received(&self, mapping_id: &str) {
        self.update(mapping_id, |status| {
            status.messages_received += 1;
            status.last_message_at = Some(Utc::now());
        });
    }

    /// Count delivered actions and local errors of a message that succeeded.
    pub fn record_success(&self, mapping_id: &str, dispatched: usize, errors: usize) {
        self.update(mapping_id, |status| {
            status.actions_dispatched += dispatched as u64;
            status.errors += errors as u64;
            status.consecutive_failures = 0;
        });
    }

    /// Count a failed message. Returns the consecutive failure count.
    pub fn record_failure(&self, mapping_id: &str, dispatched: usize, errors: usize, reason: String) -> u32 {
        self.update(mapping_id, |status| {
            status.actions_dispatched += dispatched as u64;
            status.errors += errors.max(1) as u64;
            status.consecutive_failures += 1;
            status.last_error = Some(reason);
            status.consecutive_failures
        })
    }

    pub fn get(&self, mapping_id: &str) -> Option<MappingStatus> {
        self.entries.get(mapping_id).map(|s| s.value().clone())
    }

    /// All statuses ordered by mapping id.
    pub fn all(&self) -> Vec<MappingStatus> {
        let mut all: Vec<MappingStatus> = self.entries.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.mapping_id.cmp(&b.mapping_id));
        all
    }

    pub fn remove(&self, mapping_id: &str) {
        self.entries.remove(mapping_id);
    }
}
