//! Sequential failover across provider plugins.
//!
//! [`Orchestrator::execute`] builds an ordered candidate list and walks it
//! one provider at a time:
//!
//! 1. skip providers that are unregistered, unsupported or out of region
//! 2. skip providers whose circuit is open
//! 3. wait for the rate limiter (or skip if the wait is over budget)
//! 4. call the plugin under the attempt timeout
//! 5. record the outcome and stop on success or a non-retryable error
//!
//! Provider failures never surface as `Err`; they are reported in the
//! returned [`AttemptResult`]. Only cancellation aborts an execution.
//!
//! Attempt log writes run on detached tasks so a slow sink never holds up a
//! result. [`Orchestrator::flush_attempt_log`] waits for the ones in flight.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use finlink_core::provider::dispatch;
use finlink_core::{
    classify, AttemptLog, ClassifiedError, Clock, ConnectionAttempt, ErrorKind,
    HealthRecordStore, InstitutionRouting, Operation, ProviderError, ProviderHealthRecord,
    ProviderId, ProviderKey, ProviderPlugin, ProviderRequest, ProviderResponse, Region,
    StoreError,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::FailoverConfig;
use crate::diagnostics::{ExecutionDiagnostics, SkipReason};
use crate::rate_limiter::{RateLimitError, RateLimiter};
use crate::scorer::ProviderScorer;

/// Message carried when no candidate could be called at all.
const NO_AVAILABLE_PROVIDERS: &str = "no available providers";

// =============================================================================
// Request / Result
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    pub request: ProviderRequest,
    pub region: Region,
    pub preferred_provider: Option<ProviderId>,
    /// Institution or account the call is made for.
    pub context_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(request: ProviderRequest, region: Region) -> Self {
        Self {
            request,
            region,
            preferred_provider: None,
            context_id: None,
        }
    }

    pub fn with_preferred(mut self, provider: impl Into<ProviderId>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn operation(&self) -> Operation {
        self.request.operation()
    }
}

/// Outcome of one [`Orchestrator::execute`] call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResult {
    pub success: bool,
    pub data: Option<ProviderResponse>,
    /// Last classified error when `success` is false.
    pub error: Option<ClassifiedError>,
    /// Provider that produced `data`, or the last one attempted.
    pub provider: Option<ProviderId>,
    /// Duration of the last provider call.
    pub response_time_ms: u64,
    pub failover_used: bool,
    pub diagnostics: ExecutionDiagnostics,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("Execution cancelled")]
    Cancelled,
}

/// Per-call outcome before it is folded into the execution.
enum CallOutcome {
    Success(ProviderResponse),
    Unsupported,
    Failed(ClassifiedError),
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    plugins: RwLock<HashMap<ProviderId, Arc<dyn ProviderPlugin>>>,
    circuit_breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    scorer: ProviderScorer,
    attempts: Arc<dyn AttemptLog>,
    pending_logs: TaskTracker,
    routing: Arc<dyn InstitutionRouting>,
    clock: Arc<dyn Clock>,
    config: FailoverConfig,
}

impl Orchestrator {
    pub fn new(
        config: FailoverConfig,
        health: Arc<dyn HealthRecordStore>,
        attempts: Arc<dyn AttemptLog>,
        routing: Arc<dyn InstitutionRouting>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let circuit_breaker = CircuitBreaker::new(
            health.clone(),
            clock.clone(),
            config.circuit_breaker.clone(),
        );
        let rate_limiter = RateLimiter::new(clock.clone());
        let scorer = ProviderScorer::new(
            attempts.clone(),
            health,
            clock.clone(),
            config.scoring.clone(),
            config.region_defaults.clone(),
        );

        Self {
            plugins: RwLock::new(HashMap::new()),
            circuit_breaker,
            rate_limiter,
            scorer,
            attempts,
            pending_logs: TaskTracker::new(),
            routing,
            clock,
            config,
        }
    }

    fn read_plugins(&self) -> RwLockReadGuard<'_, HashMap<ProviderId, Arc<dyn ProviderPlugin>>> {
        self.plugins.read().unwrap_or_else(|poisoned| {
            warn!("Plugin registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_plugins(&self) -> RwLockWriteGuard<'_, HashMap<ProviderId, Arc<dyn ProviderPlugin>>> {
        self.plugins.write().unwrap_or_else(|poisoned| {
            warn!("Plugin registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Registers a plugin under its id, replacing any previous one.
    ///
    /// The plugin's rate limit policy applies unless the configuration
    /// overrides it for this provider.
    pub fn register(&self, plugin: Arc<dyn ProviderPlugin>) {
        let id = plugin.id();
        let policy = self
            .config
            .rate_limit_override(id)
            .cloned()
            .unwrap_or_else(|| plugin.rate_limit());
        debug!(
            "Registering provider '{}' ({}/min, {}/h)",
            id, policy.requests_per_minute, policy.requests_per_hour
        );
        self.rate_limiter.configure(id, policy);
        if self.write_plugins().insert(ProviderId::Borrowed(id), plugin).is_some() {
            info!("Replaced provider plugin '{}'", id);
        }
    }

    /// Registered provider ids, sorted.
    pub fn registered_providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self.read_plugins().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn plugin(&self, provider: &str) -> Option<Arc<dyn ProviderPlugin>> {
        self.read_plugins().get(provider).cloned()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn scorer(&self) -> &ProviderScorer {
        &self.scorer
    }

    // -------------------------------------------------------------------------
    // Candidate selection
    // -------------------------------------------------------------------------

    /// Ordered, de-duplicated providers to try for `request`.
    async fn candidates(&self, request: &ExecuteRequest) -> Vec<ProviderId> {
        let region = request.region;
        let defaults = self.config.region_defaults.providers(region);

        let route = request.context_id.as_deref().and_then(|context_id| {
            match self.routing.route(context_id, region) {
                Ok(route) => route,
                Err(e) => {
                    warn!(
                        "Institution routing failed for '{}' in {}: {}",
                        context_id, region, e
                    );
                    None
                }
            }
        });
        let backups = route.map(|r| r.providers()).unwrap_or_else(|| defaults.clone());

        let mut ordered = Vec::with_capacity(backups.len() + 1);
        match (&request.preferred_provider, &request.context_id) {
            (Some(preferred), _) => {
                ordered.push(preferred.clone());
                ordered.extend(backups);
            }
            (None, Some(_)) => match self.scorer.rank(&backups, region).await {
                Ok(ranked) => ordered.extend(ranked.into_iter().map(|s| s.provider)),
                Err(e) => {
                    debug!("Provider scoring failed, using region defaults: {}", e);
                    ordered.extend(defaults);
                }
            },
            (None, None) => ordered.extend(backups),
        }

        let mut seen = Vec::with_capacity(ordered.len());
        ordered.retain(|p| {
            if seen.contains(p) {
                false
            } else {
                seen.push(p.clone());
                true
            }
        });
        ordered
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Runs `request` against the first provider that can serve it.
    pub async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult, ExecuteError> {
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        let operation = request.operation();
        let region = request.region;
        let candidates = self.candidates(&request).await;
        debug!(
            "Executing {} in {} with candidates [{}]",
            operation,
            region,
            candidates.join(", ")
        );

        let mut diagnostics = ExecutionDiagnostics::new();
        let mut attempted = 0usize;
        let mut last_error: Option<ClassifiedError> = None;
        let mut last_provider: Option<ProviderId> = None;
        let mut last_response_time_ms = 0u64;

        for provider_id in candidates {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }

            let Some(plugin) = self.plugin(&provider_id) else {
                diagnostics.record_skip(provider_id, SkipReason::NotRegistered);
                continue;
            };
            let capabilities = plugin.capabilities();
            if !capabilities.supports(operation) {
                diagnostics.record_skip(provider_id, SkipReason::OperationNotSupported);
                continue;
            }
            if !capabilities.serves(region) {
                diagnostics.record_skip(provider_id, SkipReason::RegionNotServed);
                continue;
            }

            let key = ProviderKey::new(provider_id.clone(), region);
            match self.circuit_breaker.is_open(&key) {
                Ok(true) => {
                    debug!("Circuit breaker open for '{}', skipping", key);
                    diagnostics.record_skip(provider_id, SkipReason::CircuitOpen);
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!("Circuit state unavailable for '{}', allowing call: {}", key, e),
            }

            match self.rate_limiter.acquire(&key, cancel).await {
                Ok(()) => {}
                Err(RateLimitError::Cancelled) => return Err(ExecuteError::Cancelled),
                Err(RateLimitError::WaitExceedsBudget { wait, .. }) => {
                    debug!("Rate limit wait {:?} for '{}' over budget, skipping", wait, key);
                    diagnostics.record_rate_limited(provider_id, wait);
                    continue;
                }
            }

            let failover_used = attempted > 0;
            let started_at = self.clock.now();
            let outcome = self
                .call(plugin.as_ref(), &request.request, cancel)
                .await?;
            let response_time_ms = finlink_core::clock::millis_between(started_at, self.clock.now());

            let error = match outcome {
                CallOutcome::Unsupported => {
                    diagnostics.record_skip(provider_id, SkipReason::OperationNotSupported);
                    continue;
                }
                CallOutcome::Success(data) => {
                    self.on_success(&key, &request, response_time_ms, failover_used);
                    diagnostics.record_success(provider_id.clone());
                    if failover_used {
                        info!(
                            "{} succeeded on '{}' after failover: {}",
                            operation,
                            key,
                            diagnostics.summary()
                        );
                    }
                    return Ok(AttemptResult {
                        success: true,
                        data: Some(data),
                        error: None,
                        provider: Some(provider_id),
                        response_time_ms,
                        failover_used,
                        diagnostics,
                    });
                }
                CallOutcome::Failed(error) => error,
            };

            attempted += 1;
            self.on_failure(&key, &request, &error, response_time_ms, failover_used);
            diagnostics.record_error(provider_id.clone(), error.kind, error.to_string());
            last_provider = Some(provider_id);
            last_response_time_ms = response_time_ms;

            let retryable = error.retryable;
            last_error = Some(error);
            if !retryable {
                debug!("Non-retryable error from '{}', not trying other providers", key);
                break;
            }
        }

        let error = last_error
            .unwrap_or_else(|| ClassifiedError::new(ErrorKind::ProviderDown, NO_AVAILABLE_PROVIDERS));
        warn!(
            "{} failed in {} after {} attempt(s): {}. Diagnostics: {}",
            operation,
            region,
            attempted,
            error,
            diagnostics.summary()
        );

        Ok(AttemptResult {
            success: false,
            data: None,
            error: Some(error),
            provider: last_provider,
            response_time_ms: last_response_time_ms,
            failover_used: attempted > 1,
            diagnostics,
        })
    }

    /// Calls the plugin under the attempt timeout, aborting on cancellation.
    async fn call(
        &self,
        plugin: &dyn ProviderPlugin,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, ExecuteError> {
        let timeout = self.config.attempt_timeout();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
            result = tokio::time::timeout(timeout, dispatch(plugin, request)) => result,
        };

        Ok(match result {
            Ok(Ok(data)) => CallOutcome::Success(data),
            Ok(Err(e)) if e.unsupported => CallOutcome::Unsupported,
            Ok(Err(e)) => CallOutcome::Failed(classify(&e)),
            Err(_) => CallOutcome::Failed(classify(&ProviderError::timed_out(plugin.id(), timeout))),
        })
    }

    fn on_success(
        &self,
        key: &ProviderKey,
        request: &ExecuteRequest,
        response_time_ms: u64,
        failover_used: bool,
    ) {
        if let Err(e) = self.circuit_breaker.record_success(key, response_time_ms) {
            warn!("Failed to record success for '{}': {}", key, e);
        }
        self.log_attempt(ConnectionAttempt::success(
            key.provider.clone(),
            key.region,
            request.operation(),
            request.context_id.clone(),
            response_time_ms,
            failover_used,
            self.clock.now(),
        ));
    }

    fn on_failure(
        &self,
        key: &ProviderKey,
        request: &ExecuteRequest,
        error: &ClassifiedError,
        response_time_ms: u64,
        failover_used: bool,
    ) {
        debug!("Provider '{}' failed: {}", key, error);
        if let Err(e) = self
            .circuit_breaker
            .record_failure(key, &error.message, Some(response_time_ms))
        {
            warn!("Failed to record failure for '{}': {}", key, e);
        }

        if error.kind == ErrorKind::RateLimit {
            let backoff = self
                .rate_limiter
                .handle_rate_limit_error(key, error.retry_after());
            let reset_at = chrono::Duration::from_std(backoff.wait)
                .ok()
                .and_then(|wait| self.clock.now().checked_add_signed(wait));
            if let Err(e) = self.circuit_breaker.mark_rate_limited(key, reset_at) {
                warn!("Failed to mark '{}' as rate limited: {}", key, e);
            }
        }

        self.log_attempt(ConnectionAttempt::failure(
            key.provider.clone(),
            key.region,
            request.operation(),
            request.context_id.clone(),
            error.kind,
            error.message.clone(),
            Some(response_time_ms),
            failover_used,
            self.clock.now(),
        ));
    }

    /// Appends `attempt` on a detached task; failures are only logged.
    fn log_attempt(&self, attempt: ConnectionAttempt) {
        let attempts = self.attempts.clone();
        self.pending_logs.spawn(async move {
            let provider = attempt.provider.clone();
            if let Err(e) = attempts.append(attempt).await {
                warn!("Failed to log connection attempt for '{}': {}", provider, e);
            }
        });
    }

    /// Waits up to `timeout` for attempt log writes still in flight.
    ///
    /// Returns false if some were still pending when the timeout elapsed.
    pub async fn flush_attempt_log(&self, timeout: Duration) -> bool {
        self.pending_logs.close();
        let drained = tokio::time::timeout(timeout, self.pending_logs.wait())
            .await
            .is_ok();
        self.pending_logs.reopen();
        if !drained {
            warn!(
                "{} attempt log write(s) still pending after {:?}",
                self.pending_logs.len(),
                timeout
            );
        }
        drained
    }

    /// Attempt log writes that have not completed yet.
    pub fn pending_attempt_writes(&self) -> usize {
        self.pending_logs.len()
    }

    // -------------------------------------------------------------------------
    // Monitoring and admin
    // -------------------------------------------------------------------------

    pub fn provider_health(&self, region: Region) -> Result<Vec<ProviderHealthRecord>, StoreError> {
        self.circuit_breaker.health_for_region(region)
    }

    /// Most recent attempts for an account or institution, newest first.
    pub async fn connection_history(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError> {
        self.attempts.history_for_context(context_id, limit).await
    }

    /// Attempts against one provider in one region since `since`, newest first.
    pub async fn provider_history(
        &self,
        key: &ProviderKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError> {
        self.attempts.history_for_provider(key, since, limit).await
    }

    pub fn reset_circuit(&self, key: &ProviderKey) -> Result<(), StoreError> {
        self.circuit_breaker.reset(key)
    }

    pub fn reset_rate_limit(&self, key: &ProviderKey) {
        self.rate_limiter.reset(key);
        info!("Rate limit window for '{}' reset", key);
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.config.attempt_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finlink_core::models::{
        AccessGrant, CreateLinkParams, ExchangeTokenParams, GetAccountsParams, LinkSession,
        LinkedAccount, ProviderStatus, SyncTransactionsParams, TransactionPage,
    };
    use finlink_core::{ManualClock, ProviderCapabilities};
    use finlink_storage_memory::{MemoryAttemptLog, MemoryHealthStore, StaticInstitutionRouting};
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicU32, Ordering};

    const US_ONLY: &[Region] = &[Region::Us];

    struct StubProvider {
        id: &'static str,
        operations: &'static [Operation],
        fail_with: Option<ProviderError>,
        calls: AtomicU32,
    }

    impl StubProvider {
        fn ok(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                operations: &Operation::ALL,
                fail_with: None,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(id: &'static str, error: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                id,
                operations: &Operation::ALL,
                fail_with: Some(error),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn respond<T>(&self, value: T) -> Result<T, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => Ok(value),
            }
        }
    }

    #[async_trait]
    impl ProviderPlugin for StubProvider {
        fn id(&self) -> &'static str {
            self.id
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                operations: self.operations,
                regions: US_ONLY,
            }
        }

        async fn health_check(&self) -> Result<ProviderStatus, ProviderError> {
            self.respond(ProviderStatus {
                healthy: true,
                message: None,
            })
        }

        async fn create_link(&self, _params: &CreateLinkParams) -> Result<LinkSession, ProviderError> {
            self.respond(LinkSession {
                link_token: format!("{}-link", self.id),
                link_url: None,
                expires_at: None,
            })
        }

        async fn exchange_token(
            &self,
            _params: &ExchangeTokenParams,
        ) -> Result<AccessGrant, ProviderError> {
            self.respond(AccessGrant {
                access_token: format!("{}-access", self.id),
                item_id: "item-1".to_string(),
                institution_id: None,
            })
        }

        async fn get_accounts(
            &self,
            _params: &GetAccountsParams,
        ) -> Result<Vec<LinkedAccount>, ProviderError> {
            self.respond(Vec::new())
        }

        async fn sync_transactions(
            &self,
            _params: &SyncTransactionsParams,
        ) -> Result<TransactionPage, ProviderError> {
            self.respond(TransactionPage::default())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        log: Arc<MemoryAttemptLog>,
    }

    fn harness(config: FailoverConfig) -> Harness {
        let log = Arc::new(MemoryAttemptLog::new());
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(MemoryHealthStore::new()),
            log.clone(),
            Arc::new(StaticInstitutionRouting::new()),
            Arc::new(ManualClock::default()),
        );
        Harness { orchestrator, log }
    }

    fn health_check() -> ExecuteRequest {
        ExecuteRequest::new(ProviderRequest::HealthCheck, Region::Us)
    }

    #[tokio::test]
    async fn test_success_on_preferred() {
        let h = harness(FailoverConfig::default());
        let plaid = StubProvider::ok("plaid");
        h.orchestrator.register(plaid.clone());

        let result = h
            .orchestrator
            .execute(health_check().with_preferred("plaid"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("plaid"));
        assert!(!result.failover_used);
        assert_eq!(plaid.calls(), 1);
        assert!(h.orchestrator.flush_attempt_log(Duration::from_secs(1)).await);
        assert_eq!(h.log.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_and_unsupported_are_skipped() {
        let h = harness(FailoverConfig::default());
        let limited = Arc::new(StubProvider {
            id: "mx",
            operations: &[Operation::HealthCheck],
            fail_with: None,
            calls: AtomicU32::new(0),
        });
        let finicity = StubProvider::ok("finicity");
        h.orchestrator.register(limited.clone());
        h.orchestrator.register(finicity.clone());

        let request = ExecuteRequest::new(
            ProviderRequest::GetInstitution {
                institution_id: "ins_1".to_string(),
            },
            Region::Us,
        );
        let result = h
            .orchestrator
            .execute(request, &CancellationToken::new())
            .await
            .unwrap();

        // plaid is unregistered, mx lacks the operation, finicity hits the
        // default not-supported body, teller is unregistered.
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::ProviderDown);
        assert_eq!(result.error.as_ref().unwrap().message, "no available providers");
        assert_eq!(result.diagnostics.attempted(), 0);
        assert_eq!(limited.calls(), 0);
        assert!(!result.failover_used);
        assert!(h.log.is_empty());
    }

    #[tokio::test]
    async fn test_region_not_served_is_skipped() {
        let h = harness(FailoverConfig::default());
        h.orchestrator.register(StubProvider::ok("plaid"));

        let request = ExecuteRequest::new(ProviderRequest::HealthCheck, Region::Ca)
            .with_preferred("plaid");
        let result = h
            .orchestrator
            .execute(request, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.diagnostics.skip_reasons()[0].1,
            &SkipReason::RegionNotServed
        );
    }

    #[tokio::test]
    async fn test_rate_limit_error_starts_backoff() {
        let h = harness(FailoverConfig::default());
        h.orchestrator.register(StubProvider::failing(
            "plaid",
            ProviderError::new("Too Many Requests")
                .with_status(429)
                .with_retry_after(Duration::from_secs(10)),
        ));
        h.orchestrator.register(StubProvider::ok("mx"));

        let result = h
            .orchestrator
            .execute(health_check().with_preferred("plaid"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.failover_used);
        assert_eq!(result.provider.as_deref(), Some("mx"));

        let key = ProviderKey::new("plaid", Region::Us);
        let window = h.orchestrator.rate_limiter().window(&key).unwrap();
        assert!(window.backoff_until.is_some());
        let health = h.orchestrator.provider_health(Region::Us).unwrap();
        let plaid = health.iter().find(|r| r.provider == "plaid").unwrap();
        assert!(plaid.rate_limited);
        assert!(plaid.rate_limit_reset_at.is_some());
    }

    #[tokio::test]
    async fn test_over_budget_wait_skips_candidate() {
        let mut config = FailoverConfig::default();
        config.rate_limits.insert(
            "plaid".to_string(),
            finlink_core::RateLimitPolicy {
                requests_per_minute: 10,
                requests_per_hour: 1,
                ..Default::default()
            },
        );
        let h = harness(config);
        let plaid = StubProvider::ok("plaid");
        h.orchestrator.register(plaid.clone());
        h.orchestrator.register(StubProvider::ok("mx"));
        let cancel = CancellationToken::new();

        h.orchestrator
            .execute(health_check().with_preferred("plaid"), &cancel)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .execute(health_check().with_preferred("plaid"), &cancel)
            .await
            .unwrap();

        assert_eq!(plaid.calls(), 1);
        assert_eq!(second.provider.as_deref(), Some("mx"));
        assert!(!second.failover_used);
        assert!(matches!(
            second.diagnostics.skip_reasons()[0].1,
            SkipReason::RateLimited { .. }
        ));
    }

    #[tokio::test]
    async fn test_institution_route_orders_backups() {
        let log = Arc::new(MemoryAttemptLog::new());
        let routing = StaticInstitutionRouting::new().with_route(
            "ins_chase",
            Region::Us,
            "finicity",
            vec![Cow::Borrowed("teller")],
        );
        let orchestrator = Orchestrator::new(
            FailoverConfig::default(),
            Arc::new(MemoryHealthStore::new()),
            log.clone(),
            Arc::new(routing),
            Arc::new(ManualClock::default()),
        );
        let finicity = StubProvider::failing("finicity", ProviderError::new("service unavailable"));
        let teller = StubProvider::ok("teller");
        let plaid = StubProvider::ok("plaid");
        orchestrator.register(finicity.clone());
        orchestrator.register(teller.clone());
        orchestrator.register(plaid.clone());

        let result = orchestrator
            .execute(
                health_check().with_preferred("finicity").with_context("ins_chase"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("teller"));
        assert_eq!(plaid.calls(), 0);

        assert!(orchestrator.flush_attempt_log(Duration::from_secs(1)).await);
        let history = orchestrator.connection_history("ins_chase", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|a| a.provider == "teller" && a.failover_used));
    }

    #[tokio::test]
    async fn test_scorer_orders_candidates_without_preference() {
        let mut config = FailoverConfig::default();
        config
            .scoring
            .costs
            .insert("teller".to_string(), rust_decimal::Decimal::new(1, 4));
        let h = harness(config);
        let plaid = StubProvider::ok("plaid");
        let teller = StubProvider::ok("teller");
        h.orchestrator.register(plaid.clone());
        h.orchestrator.register(teller.clone());

        let result = h
            .orchestrator
            .execute(health_check().with_context("acct-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.provider.as_deref(), Some("teller"));
        assert_eq!(plaid.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(FailoverConfig::default());
        h.orchestrator.register(StubProvider::ok("plaid"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.orchestrator.execute(health_check(), &cancel).await;
        assert_eq!(result, Err(ExecuteError::Cancelled));
        assert!(h.log.is_empty());
    }

    #[tokio::test]
    async fn test_registered_providers_sorted() {
        let h = harness(FailoverConfig::default());
        h.orchestrator.register(StubProvider::ok("teller"));
        h.orchestrator.register(StubProvider::ok("mx"));
        h.orchestrator.register(StubProvider::ok("mx"));
        assert_eq!(h.orchestrator.registered_providers(), vec!["mx", "teller"]);
    }

    #[tokio::test]
    async fn test_reset_circuit_and_rate_limit() {
        let h = harness(FailoverConfig::default());
        let key = ProviderKey::new("plaid", Region::Us);
        for _ in 0..5 {
            h.orchestrator
                .circuit_breaker()
                .record_failure(&key, "down", None)
                .unwrap();
        }
        h.orchestrator.rate_limiter().record_request(&key);
        assert!(h.orchestrator.circuit_breaker().is_open(&key).unwrap());

        h.orchestrator.reset_circuit(&key).unwrap();
        h.orchestrator.reset_rate_limit(&key);

        assert!(!h.orchestrator.circuit_breaker().is_open(&key).unwrap());
        assert!(h.orchestrator.rate_limiter().window(&key).is_none());
    }
}
