//! Provider capabilities and rate limiting policy.
//!
//! This module defines structures describing what an aggregator provider can
//! do and how hard we may call it.

use serde::{Deserialize, Serialize};

use crate::models::{Operation, Region};

/// Describes the capabilities of a provider plugin.
///
/// Used by the orchestrator to skip providers that cannot serve a request
/// before any attempt is made.
#[derive(Clone, Debug)]
pub struct ProviderCapabilities {
    /// Operations this provider implements.
    pub operations: &'static [Operation],

    /// Regions this provider serves.
    pub regions: &'static [Region],
}

impl ProviderCapabilities {
    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn serves(&self, region: Region) -> bool {
        self.regions.contains(&region)
    }
}

/// Volume tier a provider is contracted at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    HighVolume,
    #[default]
    Standard,
    /// Low-volume and crypto exchange providers.
    LowVolume,
    /// Internal or manual data sources.
    Internal,
}

/// Rate limiting and backoff policy for a provider.
///
/// Controls how aggressively we can call a provider to avoid hitting its
/// limits and getting blocked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Consecutive rate-limit errors tolerated before giving up.
    pub max_retries: u32,
    /// Upper bound for any single wait, in milliseconds.
    pub max_backoff_ms: u64,
    /// First backoff delay, in milliseconds.
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RateLimitPolicy {
    pub fn for_tier(tier: ProviderTier) -> Self {
        let base = Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            max_retries: 5,
            max_backoff_ms: 300_000,
            base_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        };

        match tier {
            ProviderTier::HighVolume => Self {
                requests_per_minute: 100,
                requests_per_hour: 3000,
                ..base
            },
            ProviderTier::Standard => base,
            ProviderTier::LowVolume => Self {
                requests_per_minute: 30,
                requests_per_hour: 500,
                max_retries: 3,
                max_backoff_ms: 600_000,
                ..base
            },
            ProviderTier::Internal => Self {
                requests_per_minute: 1000,
                requests_per_hour: 10_000,
                max_retries: 0,
                max_backoff_ms: 0,
                ..base
            },
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::for_tier(ProviderTier::Standard)
    }
}
