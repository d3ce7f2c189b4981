//! finlink failover - resilient execution across aggregator providers.
//!
//! Ties the per-provider protections together behind one entry point:
//!
//! ```text
//!   execute(request, cancel)
//!          │
//!          ▼
//!   +------------------+   no preference: rank route / region defaults
//!   |  ProviderScorer  |
//!   +------------------+
//!          │ ordered candidates
//!          ▼
//!   +------------------+   open circuit → skip
//!   |  CircuitBreaker  |
//!   +------------------+
//!          │
//!          ▼
//!   +------------------+   wait within budget, else skip
//!   |   RateLimiter    |
//!   +------------------+
//!          │
//!          ▼
//!   +------------------+   timeout / cancellation bound
//!   |  ProviderPlugin  |
//!   +------------------+
//!          │
//!          ▼
//!   classify → record health → log attempt → next candidate or return
//! ```
//!
//! # Core Types
//!
//! - [`Orchestrator`] - sequential failover engine
//! - [`CircuitBreaker`] - per (provider, region) health state machine
//! - [`RateLimiter`] - per (provider, region) admission control and backoff
//! - [`ProviderScorer`] - weighted provider ranking from attempt history
//! - [`FailoverConfig`] - configuration for all of the above

pub mod circuit_breaker;
pub mod config;
pub mod diagnostics;
pub mod orchestrator;
pub mod rate_limiter;
pub mod scorer;

pub use circuit_breaker::{
    transition, CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitSnapshot, Transition,
};
pub use config::{ConfigError, FailoverConfig, RegionDefaults};
pub use diagnostics::{CandidateOutcome, ExecutionDiagnostics, SkipReason};
pub use orchestrator::{AttemptResult, ExecuteError, ExecuteRequest, Orchestrator};
pub use rate_limiter::{
    BackoffDecision, BlockReason, GuardedCallError, RateLimitDecision, RateLimitError,
    RateLimitSignal, RateLimitWindow, RateLimiter,
};
pub use scorer::{
    score, ProviderMetricsSnapshot, ProviderScorer, ScoredProvider, ScoringConfig, ScoringError,
    ScoringWeights,
};
