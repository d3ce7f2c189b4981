//! finlink core - domain types and collaborator traits.
//!
//! This crate holds everything the execution engine and its collaborators
//! agree on. It has no opinion about persistence or transport; store traits
//! are implemented by the `storage-memory` crate (or any other backend).
//!
//! # Core Types
//!
//! - [`ProviderKey`] - (provider, region) key for all per-provider state
//! - [`ProviderHealthRecord`] - persisted provider health and circuit state
//! - [`ConnectionAttempt`] - append-only attempt log entry
//! - [`ProviderRequest`] / [`ProviderResponse`] - operations routed to providers
//! - [`ClassifiedError`] - provider failure mapped onto the retry taxonomy
//! - [`ProviderPlugin`] - trait every aggregator adapter implements

pub mod clock;
pub mod errors;
pub mod models;
pub mod provider;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{classify, ClassifiedError, ErrorKind, ProviderError, StoreError, ValidationError};
pub use models::{
    AttemptStatus, CircuitState, ConnectionAttempt, HealthStatus, Operation,
    ProviderHealthRecord, ProviderId, ProviderKey, ProviderRequest, ProviderResponse, Region,
};
pub use provider::{ProviderCapabilities, ProviderPlugin, ProviderTier, RateLimitPolicy};
pub use store::{AttemptLog, HealthRecordStore, InstitutionRoute, InstitutionRouting};
