//! Mapping store.
//!
//! Mappings are persisted as JSON in a redb table and mirrored in an
//! in-memory index of immutable snapshots. Processing always works on an
//! `Arc<Mapping>` taken from the index, so an update never changes a
//! mapping under a message that is already being processed.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use dynmap_core::mapping::{Direction, Mapping, TargetApi};
use dynmap_core::topic;

use crate::error::{Error, Result};
use crate::state::StateStore;

// Mappings table: key = mapping id, value = Mapping (JSON)
const MAPPINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mappings");

/// Persistent mapping registry with topic resolution.
pub struct MappingStore {
    db: Option<Arc<Database>>,
    index: DashMap<String, Arc<Mapping>>,
    state: Arc<dyn StateStore>,
}

impl MappingStore {
    /// Open or create a store backed by a redb file and load every mapping.
    pub fn open<P: AsRef<Path>>(path: P, state: Arc<dyn StateStore>) -> Result<Self> {
        let path = path.as_ref();
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        let store = Self {
            db: Some(Arc::new(db)),
            index: DashMap::new(),
            state,
        };
        store.ensure_tables()?;
        let loaded = store.load_all()?;
        info!(count = loaded, path = %path.display(), "Loaded mappings");
        Ok(store)
    }

    /// A store that keeps mappings in memory only.
    pub fn memory(state: Arc<dyn StateStore>) -> Self {
        Self {
            db: None,
            index: DashMap::new(),
            state,
        }
    }

    fn ensure_tables(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MAPPINGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_all(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MAPPINGS_TABLE)?;

        let mut count = 0;
        for entry in table.iter()? {
            let (key, data) = entry?;
            match serde_json::from_slice::<Mapping>(data.value()) {
                Ok(mapping) => {
                    self.index.insert(mapping.id.clone(), Arc::new(mapping));
                    count += 1;
                }
                Err(e) => warn!(id = key.value(), error = %e, "Skipping unreadable mapping"),
            }
        }
        Ok(count)
    }

    fn persist(&self, mapping: &Mapping) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let value = serde_json::to_vec(mapping)?;
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MAPPINGS_TABLE)?;
            table.insert(mapping.id.as_str(), value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Validate and store a mapping, replacing any previous version.
    pub fn upsert(&self, mut mapping: Mapping) -> Result<Arc<Mapping>> {
        mapping.validate()?;
        mapping.last_update = Some(Utc::now().timestamp_millis());
        self.persist(&mapping)?;

        let snapshot = Arc::new(mapping);
        self.index.insert(snapshot.id.clone(), snapshot.clone());
        debug!(mapping = %snapshot.id, topic = %snapshot.mapping_topic, "Stored mapping");
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mapping>> {
        self.index.get(id).map(|m| m.value().clone())
    }

    /// All mappings ordered by id.
    pub fn list(&self) -> Vec<Arc<Mapping>> {
        let mut all: Vec<Arc<Mapping>> = self.index.iter().map(|m| m.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Delete a mapping together with its Smart Function state.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.index.remove(id).is_some();
        if let Some(db) = &self.db {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(MAPPINGS_TABLE)?;
                let _ = table.remove(id)?;
            }
            write_txn.commit()?;
        }
        self.state.clear(id).await?;
        if existed {
            info!(mapping = %id, "Deleted mapping");
        }
        Ok(existed)
    }

    /// Activate or deactivate a mapping.
    pub fn set_active(&self, id: &str, active: bool) -> Result<Arc<Mapping>> {
        let current = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("mapping {}", id)))?;
        let mut updated = (*current).clone();
        updated.active = active;
        self.upsert(updated)
    }

    /// Active inbound mappings subscribed to `topic`, most specific first.
    pub fn resolve_inbound(&self, topic_name: &str) -> Vec<Arc<Mapping>> {
        let mut matched: Vec<Arc<Mapping>> = self
            .index
            .iter()
            .filter(|m| {
                m.active
                    && m.direction == Direction::Inbound
                    && topic::matches(&m.mapping_topic, topic_name)
            })
            .map(|m| m.value().clone())
            .collect();
        matched.sort_by(|a, b| {
            topic::specificity(&b.mapping_topic)
                .cmp(&topic::specificity(&a.mapping_topic))
                .then_with(|| a.id.cmp(&b.id))
        });
        matched
    }

    /// Active outbound mappings for platform objects of `api`.
    pub fn resolve_outbound(&self, api: TargetApi) -> Vec<Arc<Mapping>> {
        let mut matched: Vec<Arc<Mapping>> = self
            .index
            .iter()
            .filter(|m| m.active && m.direction == Direction::Outbound && m.target_api == api)
            .map(|m| m.value().clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn state(&self) -> Arc<dyn StateStore> {
        self.state.clone()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use dynmap_core::substitution::Substitution;

    fn mapping(id: &str, topic: &str) -> Mapping {
        Mapping::new(id, topic, TargetApi::Measurement)
            .with_substitution(Substitution::new("t", "c8y_T.T.value"))
    }

    #[test]
    fn test_resolve_inbound_prefers_specific_topics() {
        let store = MappingStore::memory(Arc::new(MemoryStateStore::new()));
        store.upsert(mapping("wide", "devices/#")).unwrap();
        store.upsert(mapping("narrow", "devices/+/temp")).unwrap();
        store.upsert(mapping("other", "other/+")).unwrap();

        let ids: Vec<String> = store
            .resolve_inbound("devices/berlin_01/temp")
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["narrow", "wide"]);
    }

    #[test]
    fn test_inactive_mappings_are_skipped() {
        let store = MappingStore::memory(Arc::new(MemoryStateStore::new()));
        store.upsert(mapping("m", "a/+")).unwrap();
        store.set_active("m", false).unwrap();
        assert!(store.resolve_inbound("a/b").is_empty());
        assert!(store.set_active("missing", true).is_err());
    }

    #[test]
    fn test_invalid_mapping_rejected() {
        let store = MappingStore::memory(Arc::new(MemoryStateStore::new()));
        let bad = mapping("bad", "a/#/b");
        assert!(matches!(store.upsert(bad), Err(Error::InvalidInput(_))));
        assert!(store.is_empty());
    }
}
