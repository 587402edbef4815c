//! Core types for the dynamic mapper.
//!
//! This crate holds the data model shared by every other crate: mapping
//! definitions, substitutions and their typed values, the domain actions a
//! mapping produces, the path language used to address documents, topic
//! helpers, the processing error taxonomy and engine configuration.

pub mod action;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod mapping;
pub mod path;
pub mod substitution;
pub mod topic;

pub use action::{
    ActionKind, CumulocityObject, CumulocityType, Destination, DeviceMessage, DomainAction,
    ExternalSource, HttpMethod,
};
pub use config::{BackpressurePolicy, EngineConfig};
pub use diagnostics::{Diagnostic, Diagnostics, ProcessingError, ProcessingStage};
pub use error::{Error, Result};
pub use filter::Filter;
pub use mapping::{
    ColumnType, CsvColumn, CsvFormat, Direction, Mapping, MappingType, Qos, SnoopStatus, TargetApi,
    TransformationType,
};
pub use path::{SourcePath, TargetPath};
pub use substitution::{
    tokens, RepairStrategy, ResolvedValue, SubstituteValue, Substitution, SubstitutionResult,
    SubstitutionType, TargetKind,
};

/// Common imports.
pub mod prelude {
    pub use crate::action::{CumulocityObject, DeviceMessage, DomainAction, ExternalSource};
    pub use crate::error::{Error, Result};
    pub use crate::mapping::{Direction, Mapping, TargetApi};
    pub use crate::substitution::{RepairStrategy, Substitution};
}
