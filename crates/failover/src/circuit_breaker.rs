//! Circuit breaker for provider health management.
//!
//! Tracks provider health per (provider, region) and temporarily disables
//! providers that are failing. State lives in the [`ProviderHealthRecord`]
//! held by a [`HealthRecordStore`], so every transition is a single atomic
//! read-modify-write of one record.
//!
//! States:
//! - **Closed**: Normal operation, calls are allowed
//! - **Open**: Provider is failing, calls are blocked until the timeout elapses
//! - **HalfOpen**: One probe call is allowed to test recovery
//!
//! All state changes go through [`transition`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use finlink_core::clock::saturating_add;
use finlink_core::{
    CircuitState, Clock, HealthRecordStore, HealthStatus, ProviderHealthRecord, ProviderKey,
    Region, StoreError,
};

/// Failures in the window before the failure rate is considered at all.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Failure ratio the window must exceed to open the circuit.
const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Time an open circuit waits before admitting a probe.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Length of the monitoring window.
const DEFAULT_WINDOW_SECS: u64 = 300;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub timeout_secs: u64,
    pub window_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> chrono::Duration {
        seconds(self.timeout_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Input to the circuit state machine.
#[derive(Clone, Copy, Debug)]
pub enum CircuitEvent<'a> {
    /// A caller wants to know whether it may call the provider.
    Check,
    Success { response_time_ms: u64 },
    Failure {
        error: &'a str,
        response_time_ms: Option<u64>,
    },
    Reset,
}

/// Result of applying one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// For [`CircuitEvent::Check`], whether the caller may proceed.
    pub admitted: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Applies `event` to `record` at time `now`.
///
/// This is the only place circuit state changes. It is pure apart from the
/// mutation of `record`, so stores can run it inside their atomic update.
pub fn transition(
    record: &mut ProviderHealthRecord,
    event: CircuitEvent<'_>,
    now: DateTime<Utc>,
    config: &CircuitBreakerConfig,
) -> Transition {
    let from = record.circuit_state;
    let admitted = match event {
        CircuitEvent::Check => check(record, now, config),
        CircuitEvent::Success { response_time_ms } => {
            roll_window(record, now, config);
            record.success_count = record.success_count.saturating_add(1);
            record.record_response_time(response_time_ms);
            record.last_success_at = Some(now);
            record.status = HealthStatus::Healthy;
            record.rate_limited = false;
            record.rate_limit_reset_at = None;
            set_state(record, CircuitState::Closed, now);
            true
        }
        CircuitEvent::Failure {
            error,
            response_time_ms,
        } => {
            roll_window(record, now, config);
            record.failure_count = record.failure_count.saturating_add(1);
            if let Some(ms) = response_time_ms {
                record.record_response_time(ms);
            }
            record.last_failure_at = Some(now);
            record.last_error = Some(error.to_string());
            record.status = HealthStatus::Degraded;

            let should_open = match record.circuit_state {
                CircuitState::HalfOpen | CircuitState::Open => true,
                CircuitState::Closed => {
                    record.failure_count >= config.failure_threshold
                        && record.failure_rate() > config.failure_rate_threshold
                }
            };
            if should_open {
                set_state(record, CircuitState::Open, now);
            }
            true
        }
        CircuitEvent::Reset => {
            record.success_count = 0;
            record.failure_count = 0;
            record.window_start_at = now;
            record.avg_response_time_ms = None;
            record.response_time_samples = 0;
            record.last_error = None;
            record.status = HealthStatus::Healthy;
            record.rate_limited = false;
            record.rate_limit_reset_at = None;
            set_state(record, CircuitState::Closed, now);
            true
        }
    };

    Transition {
        from,
        to: record.circuit_state,
        admitted,
    }
}

fn check(record: &mut ProviderHealthRecord, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> bool {
    let timeout = config.timeout();
    match record.circuit_state {
        CircuitState::Closed => true,
        CircuitState::Open => {
            let elapsed = record
                .state_changed_at
                .map_or(true, |changed| now - changed > timeout);
            if elapsed {
                set_state(record, CircuitState::HalfOpen, now);
                record.probe_started_at = Some(now);
            }
            elapsed
        }
        CircuitState::HalfOpen => {
            // A probe that never reported back releases its lease after the timeout.
            let lease_free = record
                .probe_started_at
                .map_or(true, |started| now - started > timeout);
            if lease_free {
                record.probe_started_at = Some(now);
            }
            lease_free
        }
    }
}

fn roll_window(record: &mut ProviderHealthRecord, now: DateTime<Utc>, config: &CircuitBreakerConfig) {
    if now - record.window_start_at >= config.window() {
        record.window_start_at = now;
        record.success_count = 0;
        record.failure_count = 0;
        record.response_time_samples = 0;
    }
}

fn set_state(record: &mut ProviderHealthRecord, state: CircuitState, now: DateTime<Utc>) {
    if record.circuit_state != state {
        record.circuit_state = state;
        record.state_changed_at = Some(now);
    }
    record.circuit_open = state != CircuitState::Closed;
    match state {
        CircuitState::Closed => record.probe_started_at = None,
        CircuitState::Open => {
            record.probe_started_at = None;
            record.status = HealthStatus::Down;
        }
        CircuitState::HalfOpen => record.status = HealthStatus::Down,
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of one circuit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Earliest time a blocked caller may be admitted again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitSnapshot {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            last_success_at: None,
            next_attempt_at: None,
        }
    }

    fn from_record(record: &ProviderHealthRecord, config: &CircuitBreakerConfig) -> Self {
        let next_attempt_at = match record.circuit_state {
            CircuitState::Closed => None,
            CircuitState::Open => record
                .state_changed_at
                .map(|at| saturating_add(at, config.timeout())),
            CircuitState::HalfOpen => record
                .probe_started_at
                .map(|at| saturating_add(at, config.timeout())),
        };
        Self {
            state: record.circuit_state,
            failures: record.failure_count,
            successes: record.success_count,
            last_failure_at: record.last_failure_at,
            last_success_at: record.last_success_at,
            next_attempt_at,
        }
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Circuit breaker over a shared health record store.
pub struct CircuitBreaker {
    store: Arc<dyn HealthRecordStore>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn HealthRecordStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn apply(
        &self,
        key: &ProviderKey,
        event: CircuitEvent<'_>,
    ) -> Result<(Transition, ProviderHealthRecord), StoreError> {
        let now = self.clock.now();
        let mut outcome = None;
        let record = self.store.update(key, now, &mut |record| {
            outcome = Some(transition(record, event, now, &self.config));
        })?;

        let outcome = outcome.ok_or_else(|| {
            StoreError::Internal(format!("health store skipped update for '{}'", key))
        })?;
        if outcome.changed() {
            info!(
                "Circuit breaker for '{}' transitioning from {} to {}",
                key, outcome.from, outcome.to
            );
        }
        Ok((outcome, record))
    }

    /// Returns true while calls to the provider must be blocked.
    ///
    /// An open circuit whose timeout has elapsed moves to half-open here, and
    /// the caller that observes the move holds the probe lease (gets `false`).
    /// Everyone else keeps getting `true` until the probe reports back.
    pub fn is_open(&self, key: &ProviderKey) -> Result<bool, StoreError> {
        match self.store.get(key)? {
            None => return Ok(false),
            Some(record) if record.circuit_state == CircuitState::Closed => return Ok(false),
            Some(_) => {}
        }

        let (outcome, _) = self.apply(key, CircuitEvent::Check)?;
        if outcome.admitted && outcome.to == CircuitState::HalfOpen {
            debug!("Circuit breaker for '{}' admitted a probe call", key);
        }
        Ok(!outcome.admitted)
    }

    pub fn record_success(
        &self,
        key: &ProviderKey,
        response_time_ms: u64,
    ) -> Result<ProviderHealthRecord, StoreError> {
        let (_, record) = self.apply(key, CircuitEvent::Success { response_time_ms })?;
        Ok(record)
    }

    pub fn record_failure(
        &self,
        key: &ProviderKey,
        error: &str,
        response_time_ms: Option<u64>,
    ) -> Result<ProviderHealthRecord, StoreError> {
        let (outcome, record) = self.apply(
            key,
            CircuitEvent::Failure {
                error,
                response_time_ms,
            },
        )?;
        if outcome.to != CircuitState::Open {
            debug!(
                "Circuit breaker for '{}': failure {}/{} in window",
                key, record.failure_count, self.config.failure_threshold
            );
        }
        Ok(record)
    }

    /// Flags the provider as throttled until `reset_at`.
    pub fn mark_rate_limited(
        &self,
        key: &ProviderKey,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<ProviderHealthRecord, StoreError> {
        let now = self.clock.now();
        self.store.update(key, now, &mut |record| {
            record.rate_limited = true;
            record.rate_limit_reset_at = reset_at;
        })
    }

    pub fn get_state(&self, key: &ProviderKey) -> Result<CircuitSnapshot, StoreError> {
        Ok(self
            .store
            .get(key)?
            .map(|record| CircuitSnapshot::from_record(&record, &self.config))
            .unwrap_or_else(CircuitSnapshot::closed))
    }

    /// Forces the circuit closed with an empty window.
    pub fn reset(&self, key: &ProviderKey) -> Result<(), StoreError> {
        self.apply(key, CircuitEvent::Reset)?;
        info!("Circuit breaker for '{}' manually reset", key);
        Ok(())
    }

    pub fn health_for_region(&self, region: Region) -> Result<Vec<ProviderHealthRecord>, StoreError> {
        self.store.list_for_region(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finlink_core::ManualClock;
    use finlink_storage_memory::MemoryHealthStore;
    use std::time::Duration;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::new(
            Arc::new(MemoryHealthStore::new()),
            clock.clone(),
            CircuitBreakerConfig::default(),
        );
        (breaker, clock)
    }

    fn key() -> ProviderKey {
        ProviderKey::new("plaid", Region::Us)
    }

    fn open_circuit(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            breaker.record_failure(&key(), "connection reset", None).unwrap();
        }
    }

    #[test]
    fn test_unknown_provider_is_closed() {
        let (breaker, _) = breaker();
        assert!(!breaker.is_open(&key()).unwrap());
        assert_eq!(breaker.get_state(&key()).unwrap().state, CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&key(), "timeout", None).unwrap();
        }
        assert!(!breaker.is_open(&key()).unwrap());

        let record = breaker.record_failure(&key(), "timeout", None).unwrap();
        assert!(breaker.is_open(&key()).unwrap());
        assert_eq!(record.circuit_state, CircuitState::Open);
        assert!(record.circuit_open);
        assert_eq!(record.status, HealthStatus::Down);
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_failure_rate_must_exceed_half() {
        let (breaker, _) = breaker();
        for _ in 0..5 {
            breaker.record_success(&key(), 100).unwrap();
        }
        for _ in 0..5 {
            breaker.record_failure(&key(), "timeout", None).unwrap();
        }
        // 5 of 10 is exactly 50%
        assert!(!breaker.is_open(&key()).unwrap());

        breaker.record_failure(&key(), "timeout", None).unwrap();
        assert!(breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_window_rolls_before_threshold_check() {
        let (breaker, clock) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&key(), "timeout", None).unwrap();
        }
        clock.advance(Duration::from_secs(301));

        let record = breaker.record_failure(&key(), "timeout", None).unwrap();
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.circuit_state, CircuitState::Closed);
        assert_eq!(record.window_start_at, clock.now());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let (breaker, clock) = breaker();
        open_circuit(&breaker);

        clock.advance(Duration::from_secs(30));
        assert!(breaker.is_open(&key()).unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(!breaker.is_open(&key()).unwrap());
        assert_eq!(breaker.get_state(&key()).unwrap().state, CircuitState::HalfOpen);

        // Probe in flight; everyone else stays blocked.
        assert!(breaker.is_open(&key()).unwrap());
        assert!(breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_abandoned_probe_lease_expires() {
        let (breaker, clock) = breaker();
        open_circuit(&breaker);
        clock.advance(Duration::from_secs(61));
        assert!(!breaker.is_open(&key()).unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(!breaker.is_open(&key()).unwrap());
        assert!(breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_half_open_success_closes() {
        let (breaker, clock) = breaker();
        open_circuit(&breaker);
        clock.advance(Duration::from_secs(61));
        assert!(!breaker.is_open(&key()).unwrap());

        let record = breaker.record_success(&key(), 250).unwrap();
        assert_eq!(record.circuit_state, CircuitState::Closed);
        assert!(!record.circuit_open);
        assert_eq!(record.status, HealthStatus::Healthy);
        assert!(record.probe_started_at.is_none());
        assert!(!breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker();
        open_circuit(&breaker);
        clock.advance(Duration::from_secs(61));
        assert!(!breaker.is_open(&key()).unwrap());

        let record = breaker.record_failure(&key(), "still down", None).unwrap();
        assert_eq!(record.circuit_state, CircuitState::Open);
        assert_eq!(record.state_changed_at, Some(clock.now()));
        assert!(breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_snapshot_reports_next_attempt() {
        let (breaker, clock) = breaker();
        open_circuit(&breaker);
        let opened_at = clock.now();

        let snapshot = breaker.get_state(&key()).unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failures, 5);
        assert_eq!(snapshot.next_attempt_at, Some(opened_at + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_snapshot_with_huge_timeout_saturates() {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::new(
            Arc::new(MemoryHealthStore::new()),
            clock.clone(),
            CircuitBreakerConfig {
                timeout_secs: 100_000_000_000_000,
                ..Default::default()
            },
        );
        open_circuit(&breaker);

        let snapshot = breaker.get_state(&key()).unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.next_attempt_at, Some(DateTime::<Utc>::MAX_UTC));

        clock.advance(Duration::from_secs(3600));
        assert!(breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_untimed_failures_keep_mean_of_timed_calls() {
        let (breaker, _) = breaker();
        breaker.record_success(&key(), 200).unwrap();
        breaker.record_failure(&key(), "connection reset", None).unwrap();
        breaker.record_failure(&key(), "connection reset", None).unwrap();
        let record = breaker.record_success(&key(), 400).unwrap();
        assert_eq!(record.avg_response_time_ms, Some(300.0));
        assert_eq!(record.response_time_samples, 2);
    }

    #[test]
    fn test_window_roll_restarts_mean() {
        let (breaker, clock) = breaker();
        breaker.record_success(&key(), 1000).unwrap();
        clock.advance(Duration::from_secs(301));
        let record = breaker.record_success(&key(), 100).unwrap();
        assert_eq!(record.avg_response_time_ms, Some(100.0));
        assert_eq!(record.response_time_samples, 1);
    }

    #[test]
    fn test_reset() {
        let (breaker, _) = breaker();
        open_circuit(&breaker);
        breaker.reset(&key()).unwrap();

        let snapshot = breaker.get_state(&key()).unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert!(!breaker.is_open(&key()).unwrap());
    }

    #[test]
    fn test_regions_are_independent() {
        let (breaker, _) = breaker();
        open_circuit(&breaker);
        let ca = ProviderKey::new("plaid", Region::Ca);
        assert!(breaker.is_open(&key()).unwrap());
        assert!(!breaker.is_open(&ca).unwrap());
    }

    #[test]
    fn test_success_clears_rate_limited_flag() {
        let (breaker, clock) = breaker();
        let record = breaker
            .mark_rate_limited(&key(), Some(clock.now() + chrono::Duration::seconds(30)))
            .unwrap();
        assert!(record.rate_limited);

        let record = breaker.record_success(&key(), 90).unwrap();
        assert!(!record.rate_limited);
        assert!(record.rate_limit_reset_at.is_none());
    }

    #[test]
    fn test_health_for_region_lists_records() {
        let (breaker, _) = breaker();
        breaker.record_success(&key(), 120).unwrap();
        breaker
            .record_failure(&ProviderKey::new("mx", Region::Us), "503", Some(900))
            .unwrap();
        breaker
            .record_success(&ProviderKey::new("truelayer", Region::Uk), 80)
            .unwrap();

        let records = breaker.health_for_region(Region::Us).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].provider, "mx");
        assert_eq!(records[0].avg_response_time_ms, Some(900.0));
    }

    #[test]
    fn test_transition_is_pure_over_record() {
        let config = CircuitBreakerConfig::default();
        let now = Utc::now();
        let mut record = ProviderHealthRecord::new(&key(), now);
        record.circuit_state = CircuitState::Open;
        record.circuit_open = true;
        record.state_changed_at = Some(now);

        let t = transition(&mut record, CircuitEvent::Check, now, &config);
        assert!(!t.admitted);
        assert!(!t.changed());

        let later = now + chrono::Duration::seconds(61);
        let t = transition(&mut record, CircuitEvent::Check, later, &config);
        assert!(t.admitted);
        assert_eq!((t.from, t.to), (CircuitState::Open, CircuitState::HalfOpen));
        assert_eq!(record.probe_started_at, Some(later));
    }
}
