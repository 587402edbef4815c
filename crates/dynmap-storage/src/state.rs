//! Per-mapping Smart Function state.
//!
//! Each mapping owns a string-keyed JSON map. The map is created empty on
//! first write and removed as a whole when the mapping is deleted. Callers
//! that need read-modify-write atomicity serialize access per mapping; the
//! stores themselves only guarantee that a single load or save is atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::{Map, Value};

use crate::error::Result;

// State table: key = mapping id, value = JSON object
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mapping_state");

/// State of one mapping.
pub type MappingState = Map<String, Value>;

/// Storage for per-mapping state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state of a mapping; an unknown mapping yields an empty map.
    async fn load(&self, mapping_id: &str) -> Result<MappingState>;

    /// Replace the state of a mapping.
    async fn save(&self, mapping_id: &str, state: &MappingState) -> Result<()>;

    /// Drop all state of a mapping. Returns whether anything was stored.
    async fn clear(&self, mapping_id: &str) -> Result<bool>;

    /// Mappings that currently have state.
    async fn mapping_ids(&self) -> Result<Vec<String>>;
}

/// In-process state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: DashMap<String, MappingState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, mapping_id: &str) -> Result<MappingState> {
        Ok(self
            .states
            .get(mapping_id)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, mapping_id: &str, state: &MappingState) -> Result<()> {
        self.states.insert(mapping_id.to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, mapping_id: &str) -> Result<bool> {
        Ok(self.states.remove(mapping_id).is_some())
    }

    async fn mapping_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// State store persisted in a redb file.
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    /// Open or create the database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(STATE_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_sync(db: &Database, mapping_id: &str) -> Result<MappingState> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        match table.get(mapping_id)? {
            Some(data) => Ok(serde_json::from_slice(data.value())?),
            None => Ok(MappingState::new()),
        }
    }

    fn save_sync(db: &Database, mapping_id: &str, state: &MappingState) -> Result<()> {
        let value = serde_json::to_vec(state)?;
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            table.insert(mapping_id, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn clear_sync(db: &Database, mapping_id: &str) -> Result<bool> {
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            let removed = table.remove(mapping_id)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn ids_sync(db: &Database) -> Result<Vec<String>> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn load(&self, mapping_id: &str) -> Result<MappingState> {
        let db = self.db.clone();
        let id = mapping_id.to_string();
        tokio::task::spawn_blocking(move || Self::load_sync(&db, &id)).await?
    }

    async fn save(&self, mapping_id: &str, state: &MappingState) -> Result<()> {
        let db = self.db.clone();
        let id = mapping_id.to_string();
        let state = state.clone();
        tokio::task::spawn_blocking(move || Self::save_sync(&db, &id, &state)).await?
    }

    async fn clear(&self, mapping_id: &str) -> Result<bool> {
        let db = self.db.clone();
        let id = mapping_id.to_string();
        tokio::task::spawn_blocking(move || Self::clear_sync(&db, &id)).await?
    }

    async fn mapping_ids(&self) -> Result<Vec<String>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::ids_sync(&db)).await?
    }
}
