//! Provider plugin abstractions.
//!
//! This module contains:
//! - The `ProviderPlugin` trait every aggregator adapter implements
//! - Provider capabilities, volume tiers and rate limiting policy
//!
//! Concrete HTTP/SDK clients live outside this workspace; the execution core
//! never depends on a concrete provider type.

mod capabilities;
mod traits;

pub use capabilities::{ProviderCapabilities, ProviderTier, RateLimitPolicy};
pub use traits::{dispatch, ProviderPlugin};
