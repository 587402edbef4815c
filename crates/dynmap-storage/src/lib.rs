//! Persistence for the dynamic mapper.
//!
//! - [`MappingStore`]: mapping snapshots in redb with topic resolution
//! - [`StateStore`]: per-mapping Smart Function state, in memory or in redb

pub mod error;
pub mod mappings;
pub mod state;

pub use error::{Error, Result};
pub use mappings::MappingStore;
pub use state::{MappingState, MemoryStateStore, RedbStateStore, StateStore};
