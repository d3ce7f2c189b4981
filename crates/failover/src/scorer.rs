//! Provider scoring.
//!
//! Ranks candidate providers by a weighted mix of reliability, latency, cost
//! and recent failures, computed from the attempt history:
//!
//! | Term | Weight | Normalized by |
//! |------|--------|---------------|
//! | success rate | 0.5 | 100% |
//! | response time | 0.2 | 5000 ms (inverted) |
//! | cost per unit | 0.2 | $0.005 (inverted) |
//! | failures in the last 7 days | 0.1 | 5 (inverted) |
//!
//! Every term is clamped to `[0, 1]` before weighting.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use finlink_core::{
    AttemptLog, Clock, HealthRecordStore, ProviderId, ProviderKey, Region, StoreError,
};

use crate::config::RegionDefaults;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScoringError {
    #[error("Provider history unavailable: {0}")]
    History(#[from] StoreError),

    #[error("No candidate or default provider for region '{0}'")]
    NoProvider(Region),
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub success_rate: f64,
    pub response_time: f64,
    pub cost: f64,
    pub recent_failures: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.5,
            response_time: 0.2,
            cost: 0.2,
            recent_failures: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Response time scoring zero on the latency term.
    pub max_response_time_ms: f64,
    /// Cost per unit scoring zero on the cost term.
    pub max_cost_per_unit: Decimal,
    /// Recent failure count scoring zero on the failure term.
    pub max_recent_failures: u32,
    pub default_success_rate: f64,
    pub default_response_time_ms: f64,
    pub default_cost_per_unit: Decimal,
    /// Cost per unit by provider id.
    pub costs: HashMap<String, Decimal>,
    pub lookback_days: i64,
    pub history_limit: usize,
    pub recent_failure_days: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            max_response_time_ms: 5000.0,
            max_cost_per_unit: Decimal::new(5, 3),
            max_recent_failures: 5,
            default_success_rate: 85.0,
            default_response_time_ms: 2000.0,
            default_cost_per_unit: Decimal::new(25, 4),
            costs: HashMap::new(),
            lookback_days: 30,
            history_limit: 100,
            recent_failure_days: 7,
        }
    }
}

impl ScoringConfig {
    pub fn cost_for(&self, provider: &str) -> Decimal {
        self.costs
            .get(provider)
            .copied()
            .unwrap_or(self.default_cost_per_unit)
    }
}

// =============================================================================
// Metrics and Scores
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetricsSnapshot {
    pub provider: ProviderId,
    pub region: Region,
    /// Percentage of successful attempts, 0 to 100.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub cost_per_unit: Decimal,
    pub recent_failure_count: u32,
    /// Attempts the metrics were computed from; zero means defaults were used.
    pub sample_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredProvider {
    pub provider: ProviderId,
    pub score: f64,
    pub metrics: ProviderMetricsSnapshot,
}

fn ratio(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 1.0;
    }
    let r = value / ceiling;
    if r.is_nan() {
        0.0
    } else {
        r.clamp(0.0, 1.0)
    }
}

fn days_before(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days.max(0))
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Weighted score of one provider's metrics.
pub fn score(metrics: &ProviderMetricsSnapshot, config: &ScoringConfig) -> f64 {
    let weights = &config.weights;
    let cost = metrics.cost_per_unit.to_f64().unwrap_or(f64::MAX);
    let max_cost = config.max_cost_per_unit.to_f64().unwrap_or(0.0);

    weights.success_rate * ratio(metrics.success_rate, 100.0)
        + weights.response_time
            * (1.0 - ratio(metrics.avg_response_time_ms, config.max_response_time_ms))
        + weights.cost * (1.0 - ratio(cost, max_cost))
        + weights.recent_failures
            * (1.0
                - ratio(
                    metrics.recent_failure_count as f64,
                    config.max_recent_failures as f64,
                ))
}

// =============================================================================
// Scorer
// =============================================================================

pub struct ProviderScorer {
    attempts: Arc<dyn AttemptLog>,
    health: Arc<dyn HealthRecordStore>,
    clock: Arc<dyn Clock>,
    config: ScoringConfig,
    region_defaults: RegionDefaults,
}

impl ProviderScorer {
    pub fn new(
        attempts: Arc<dyn AttemptLog>,
        health: Arc<dyn HealthRecordStore>,
        clock: Arc<dyn Clock>,
        config: ScoringConfig,
        region_defaults: RegionDefaults,
    ) -> Self {
        Self {
            attempts,
            health,
            clock,
            config,
            region_defaults,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Metrics for one provider over the lookback window.
    pub async fn metrics(
        &self,
        provider: &ProviderId,
        region: Region,
    ) -> Result<ProviderMetricsSnapshot, ScoringError> {
        let key = ProviderKey::new(provider.clone(), region);
        let now = self.clock.now();
        let since = days_before(now, self.config.lookback_days);
        let history = self
            .attempts
            .history_for_provider(&key, since, self.config.history_limit)
            .await?;

        let success_rate = if history.is_empty() {
            self.config.default_success_rate
        } else {
            let successes = history.iter().filter(|a| a.is_success()).count();
            successes as f64 / history.len() as f64 * 100.0
        };

        let timings: Vec<u64> = history.iter().filter_map(|a| a.response_time_ms).collect();
        let avg_response_time_ms = if timings.is_empty() {
            self.health
                .get(&key)?
                .and_then(|record| record.avg_response_time_ms)
                .unwrap_or(self.config.default_response_time_ms)
        } else {
            timings.iter().sum::<u64>() as f64 / timings.len() as f64
        };

        let recent_since = days_before(now, self.config.recent_failure_days);
        let recent_failure_count = history
            .iter()
            .filter(|a| !a.is_success() && a.attempted_at >= recent_since)
            .count() as u32;

        Ok(ProviderMetricsSnapshot {
            provider: provider.clone(),
            region,
            success_rate,
            avg_response_time_ms,
            cost_per_unit: self.config.cost_for(provider),
            recent_failure_count,
            sample_size: history.len(),
        })
    }

    /// Scores every candidate, best first. Equal scores keep candidate order.
    pub async fn rank(
        &self,
        candidates: &[ProviderId],
        region: Region,
    ) -> Result<Vec<ScoredProvider>, ScoringError> {
        let mut scored = Vec::with_capacity(candidates.len());
        for provider in candidates {
            if scored.iter().any(|s: &ScoredProvider| &s.provider == provider) {
                continue;
            }
            let metrics = self.metrics(provider, region).await?;
            scored.push(ScoredProvider {
                provider: provider.clone(),
                score: score(&metrics, &self.config),
                metrics,
            });
        }

        // Vec::sort_by is stable.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            "Provider ranking for {}: {}",
            region,
            scored
                .iter()
                .map(|s| format!("{}={:.3}", s.provider, s.score))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(scored)
    }

    /// Highest scoring candidate, or the region default when there are none.
    pub async fn select(
        &self,
        candidates: &[ProviderId],
        region: Region,
    ) -> Result<ProviderId, ScoringError> {
        if candidates.is_empty() {
            return self
                .region_defaults
                .primary(region)
                .ok_or(ScoringError::NoProvider(region));
        }
        self.rank(candidates, region)
            .await?
            .into_iter()
            .next()
            .map(|s| s.provider)
            .ok_or(ScoringError::NoProvider(region))
    }
}
