//! Provider health records.
//!
//! One record exists per (provider, region). Records are created lazily on
//! the first recorded outcome and updated in place afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProviderId, ProviderKey, Region};

// =============================================================================
// Status
// =============================================================================

/// Coarse health status shown on monitoring dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Circuit State
// =============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests are allowed.
    #[default]
    Closed,
    /// Provider is failing - requests are blocked.
    Open,
    /// Testing recovery - a single probe request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

// =============================================================================
// Health Record
// =============================================================================

/// Persisted health of one provider in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthRecord {
    pub provider: ProviderId,
    pub region: Region,
    pub status: HealthStatus,
    /// Successes in the current monitoring window.
    pub success_count: u32,
    /// Failures in the current monitoring window.
    pub failure_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Mirrors `circuit_state != Closed`; kept for consumers that only read the flag.
    pub circuit_open: bool,
    pub circuit_state: CircuitState,
    /// When `circuit_state` last changed.
    pub state_changed_at: Option<DateTime<Utc>>,
    /// Set while a half-open probe is in flight.
    pub probe_started_at: Option<DateTime<Utc>>,
    pub window_start_at: DateTime<Utc>,
    /// Mean response time of calls recorded in the current window.
    pub avg_response_time_ms: Option<f64>,
    /// Samples folded into `avg_response_time_ms` in the current window.
    #[serde(default)]
    pub response_time_samples: u32,
    pub rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderHealthRecord {
    /// Creates a fresh, healthy record with an empty window starting at `now`.
    pub fn new(key: &ProviderKey, now: DateTime<Utc>) -> Self {
        Self {
            provider: key.provider.clone(),
            region: key.region,
            status: HealthStatus::Healthy,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            circuit_open: false,
            circuit_state: CircuitState::Closed,
            state_changed_at: None,
            probe_started_at: None,
            window_start_at: now,
            avg_response_time_ms: None,
            response_time_samples: 0,
            rate_limited: false,
            rate_limit_reset_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ProviderKey {
        ProviderKey::new(self.provider.clone(), self.region)
    }

    /// Total calls recorded in the current window.
    pub fn total_calls(&self) -> u32 {
        self.success_count.saturating_add(self.failure_count)
    }

    /// Failure ratio in the current window, 0.0 when nothing was recorded.
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    /// Folds a response time sample into the window mean.
    ///
    /// The first sample of a window replaces whatever mean the previous
    /// window left behind.
    pub fn record_response_time(&mut self, response_time_ms: u64) {
        self.response_time_samples = self.response_time_samples.saturating_add(1);
        let samples = self.response_time_samples as f64;
        let sample = response_time_ms as f64;
        self.avg_response_time_ms = Some(match self.avg_response_time_ms {
            Some(avg) if samples > 1.0 => avg + (sample - avg) / samples,
            _ => sample,
        });
    }
}
