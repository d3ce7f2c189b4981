//! Fixed-window rate limiter with exponential backoff.
//!
//! Each (provider, region) gets a [`RateLimitWindow`] counting requests in
//! the current minute and hour. Provider-side throttling (HTTP 429 and the
//! like) pushes the window into backoff, which blocks admission until it
//! expires.
//!
//! Windows live in a `DashMap` with one mutex per key, so providers never
//! contend with each other. Waiting always happens outside the lock.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use finlink_core::clock::saturating_add;
use finlink_core::{
    classify, Clock, ErrorKind, ProviderError, ProviderId, ProviderKey, RateLimitPolicy,
};

/// Jitter applied to computed backoff, as a fraction of the delay.
const JITTER_RATIO: f64 = 0.1;

// =============================================================================
// Window
// =============================================================================

/// Request counters for one provider in one region.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub requests_in_minute: u32,
    pub requests_in_hour: u32,
    pub minute_window_start: DateTime<Utc>,
    pub hour_window_start: DateTime<Utc>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub consecutive_retries: u32,
}

impl RateLimitWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            requests_in_minute: 0,
            requests_in_hour: 0,
            minute_window_start: now,
            hour_window_start: now,
            backoff_until: None,
            consecutive_retries: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.minute_window_start >= chrono::Duration::seconds(60) {
            self.requests_in_minute = 0;
            self.minute_window_start = now;
        }
        if now - self.hour_window_start >= chrono::Duration::seconds(3600) {
            self.requests_in_hour = 0;
            self.hour_window_start = now;
        }
    }

    fn check(&mut self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> RateLimitDecision {
        self.roll(now);

        if let Some(until) = self.backoff_until.filter(|until| *until > now) {
            return RateLimitDecision::blocked(BlockReason::Backoff, until - now);
        }
        if self.requests_in_minute >= policy.requests_per_minute {
            let reopens = self.minute_window_start + chrono::Duration::seconds(60);
            return RateLimitDecision::blocked(BlockReason::MinuteLimit, reopens - now);
        }
        if self.requests_in_hour >= policy.requests_per_hour {
            let reopens = self.hour_window_start + chrono::Duration::seconds(3600);
            return RateLimitDecision::blocked(BlockReason::HourLimit, reopens - now);
        }
        RateLimitDecision::allowed()
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.requests_in_minute = self.requests_in_minute.saturating_add(1);
        self.requests_in_hour = self.requests_in_hour.saturating_add(1);
        self.consecutive_retries = 0;
        self.backoff_until = None;
    }

    /// Enters backoff for the `retries`-th consecutive throttling error.
    fn back_off(
        &mut self,
        policy: &RateLimitPolicy,
        retries: u32,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> BackoffDecision {
        self.consecutive_retries = retries;
        if retries > policy.max_retries {
            return BackoffDecision {
                should_retry: false,
                wait: Duration::ZERO,
            };
        }

        let wait = backoff_delay(policy, retries, retry_after);
        self.backoff_until = Some(saturating_add(now, to_chrono(wait)));
        BackoffDecision {
            should_retry: true,
            wait,
        }
    }
}

/// Delay before the `retries`-th retry.
///
/// A server-supplied `retry_after` is used as is; computed delays get ±10%
/// jitter. Either way the result never exceeds `max_backoff_ms`.
fn backoff_delay(policy: &RateLimitPolicy, retries: u32, retry_after: Option<Duration>) -> Duration {
    let cap_ms = policy.max_backoff_ms as f64;
    let delay_ms = match retry_after {
        Some(server) => server.as_millis() as f64,
        None => {
            let exponent = retries.saturating_sub(1).min(i32::MAX as u32) as i32;
            let base = policy.base_backoff_ms as f64 * policy.backoff_multiplier.powi(exponent);
            let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
            base * (1.0 + jitter)
        }
    };
    let delay_ms = if delay_ms.is_finite() { delay_ms.clamp(0.0, cap_ms) } else { cap_ms };
    Duration::from_millis(delay_ms.round() as u64)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn to_std(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

// =============================================================================
// Decisions and Errors
// =============================================================================

/// Why a request is not admitted right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Backoff,
    MinuteLimit,
    HourLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Backoff => "backoff",
            BlockReason::MinuteLimit => "minute_limit",
            BlockReason::HourLimit => "hour_limit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Time until the blocking condition clears; zero when allowed.
    pub wait: Duration,
    pub reason: Option<BlockReason>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            reason: None,
        }
    }

    fn blocked(reason: BlockReason, wait: chrono::Duration) -> Self {
        Self {
            allowed: false,
            // Never report a zero wait for a blocked request.
            wait: to_std(wait).max(Duration::from_millis(1)),
            reason: Some(reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackoffDecision {
    pub should_retry: bool,
    pub wait: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit wait of {wait:?} for '{key}' exceeds the {budget:?} budget ({reason})")]
    WaitExceedsBudget {
        key: ProviderKey,
        wait: Duration,
        budget: Duration,
        reason: &'static str,
    },

    #[error("Rate limit wait cancelled")]
    Cancelled,
}

/// Failure of a call made through [`RateLimiter::execute_with_rate_limit`].
#[derive(Error, Debug)]
pub enum GuardedCallError<E> {
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Call(E),
}

/// Lets [`RateLimiter::execute_with_rate_limit`] recognise throttling errors.
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;

    /// Server-supplied wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RateLimitSignal for ProviderError {
    fn is_rate_limited(&self) -> bool {
        classify(self).kind == ErrorKind::RateLimit
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-(provider, region) admission control.
pub struct RateLimiter {
    windows: DashMap<ProviderKey, Arc<Mutex<RateLimitWindow>>>,
    policies: DashMap<ProviderId, RateLimitPolicy>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            policies: DashMap::new(),
            clock,
        }
    }

    /// Sets the policy for a provider in every region.
    pub fn configure(&self, provider: impl Into<ProviderId>, policy: RateLimitPolicy) {
        self.policies.insert(provider.into(), policy);
    }

    /// Policy in force for `provider`; the standard tier when unconfigured.
    pub fn policy(&self, provider: &str) -> RateLimitPolicy {
        self.policies
            .get(provider)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    fn window_for(&self, key: &ProviderKey) -> Arc<Mutex<RateLimitWindow>> {
        if let Some(window) = self.windows.get(key) {
            return Arc::clone(window.value());
        }
        let now = self.clock.now();
        Arc::clone(
            self.windows
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(RateLimitWindow::new(now))))
                .value(),
        )
    }

    fn lock(window: &Mutex<RateLimitWindow>) -> MutexGuard<'_, RateLimitWindow> {
        window.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limit window mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Checks, without recording, whether a request may go out now.
    ///
    /// Active backoff is reported first, then the minute limit, then the hour limit.
    pub fn can_make_request(&self, key: &ProviderKey) -> RateLimitDecision {
        let policy = self.policy(&key.provider);
        let window = self.window_for(key);
        let now = self.clock.now();
        let decision = Self::lock(&window).check(&policy, now);
        decision
    }

    /// Counts a request against both windows and ends any backoff.
    pub fn record_request(&self, key: &ProviderKey) {
        let window = self.window_for(key);
        let now = self.clock.now();
        Self::lock(&window).record(now);
    }

    /// Registers a throttling response and starts backoff.
    pub fn handle_rate_limit_error(
        &self,
        key: &ProviderKey,
        retry_after: Option<Duration>,
    ) -> BackoffDecision {
        let policy = self.policy(&key.provider);
        let window = self.window_for(key);
        let now = self.clock.now();
        let decision = {
            let mut window = Self::lock(&window);
            let retries = window.consecutive_retries.saturating_add(1);
            window.back_off(&policy, retries, retry_after, now)
        };

        if decision.should_retry {
            debug!("Rate limited by '{}', backing off {:?}", key, decision.wait);
        } else {
            warn!(
                "Rate limited by '{}' more than {} times in a row, giving up",
                key, policy.max_retries
            );
        }
        decision
    }

    /// Waits until a request is admitted and records it.
    ///
    /// The check and the record happen under the same lock, so concurrent
    /// callers can never overshoot a limit. A wait longer than the policy's
    /// `max_backoff_ms` fails immediately instead of sleeping.
    pub async fn acquire(
        &self,
        key: &ProviderKey,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        let policy = self.policy(&key.provider);
        let budget = Duration::from_millis(policy.max_backoff_ms);
        let window = self.window_for(key);

        loop {
            let decision = {
                let now = self.clock.now();
                let mut window = Self::lock(&window);
                let decision = window.check(&policy, now);
                if decision.allowed {
                    window.record(now);
                }
                decision
            };

            let Some(reason) = decision.reason else {
                return Ok(());
            };

            if decision.wait > budget {
                return Err(RateLimitError::WaitExceedsBudget {
                    key: key.clone(),
                    wait: decision.wait,
                    budget,
                    reason: reason.as_str(),
                });
            }

            debug!(
                "Rate limiter: waiting {:?} for '{}' ({})",
                decision.wait,
                key,
                reason.as_str()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = self.clock.sleep(decision.wait) => {}
            }
        }
    }

    /// Runs `call` behind the limiter, retrying throttling errors with backoff.
    ///
    /// Errors that are not throttling are returned on first occurrence.
    pub async fn execute_with_rate_limit<T, E, F, Fut>(
        &self,
        key: &ProviderKey,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, GuardedCallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RateLimitSignal,
    {
        // `acquire` records the request, which clears the window's retry
        // counter, so consecutive throttles are counted here.
        let mut retries = 0u32;
        loop {
            self.acquire(key, cancel).await?;

            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_rate_limited() => error,
                Err(error) => return Err(GuardedCallError::Call(error)),
            };

            retries = retries.saturating_add(1);
            let policy = self.policy(&key.provider);
            let window = self.window_for(key);
            let now = self.clock.now();
            let decision = Self::lock(&window).back_off(&policy, retries, error.retry_after(), now);

            if !decision.should_retry {
                warn!(
                    "Rate limited by '{}' {} times, not retrying",
                    key, retries
                );
                return Err(GuardedCallError::Call(error));
            }
            debug!(
                "Rate limited by '{}' (retry {}/{}), backing off {:?}",
                key, retries, policy.max_retries, decision.wait
            );
        }
    }

    pub fn reset(&self, key: &ProviderKey) {
        self.windows.remove(key);
    }

    pub fn reset_all(&self) {
        self.windows.clear();
    }

    /// Snapshot of the window for `key`, if one exists.
    pub fn window(&self, key: &ProviderKey) -> Option<RateLimitWindow> {
        let window = self.windows.get(key).map(|w| Arc::clone(w.value()))?;
        let snapshot = Self::lock(&window).clone();
        Some(snapshot)
    }
}
