//! Message processing for the dynamic mapper.
//!
//! [`MappingEngine`] takes transport messages through normalization,
//! substitution or Smart Function execution, assembly and dispatch. Identity
//! resolution and platform access sit behind the traits in [`api`], so the
//! engine runs unchanged against the REST client or the in-memory platform.

pub mod api;
pub mod assembler;
#[cfg(feature = "http")]
pub mod client;
pub mod dispatch;
pub mod identity;
pub mod memory;
pub mod normalizer;
pub mod pipeline;
pub mod resolver;
pub mod status;
pub mod warmup;

pub use api::{
    ApiError, InventoryApi, OutboundMessage, OutboundTransport, PlatformApi, PlatformRequest,
    PlatformResponse,
};
#[cfg(feature = "http")]
pub use client::PlatformClient;
pub use dispatch::{DispatchCoordinator, DispatchError, DispatchReceipt, DispatchStatus};
pub use identity::{
    IdentityError, IdentityRequest, IdentityResolver, InventoryCache, PlatformRef, Resolution,
    ResolutionHook,
};
pub use memory::{InMemoryPlatform, InMemoryTransport};
pub use normalizer::{normalize, NormalizedMessage, TransportMessage};
pub use pipeline::{MappingEngine, OutcomeState, ProcessingOutcome};
pub use status::{MappingStatus, StatusRegistry};
pub use warmup::InventoryWarmer;
