//! Per-execution record of which providers were skipped, tried and why.

use std::time::Duration;

use serde::Serialize;

use finlink_core::{ErrorKind, ProviderId};

/// Why a candidate was passed over without being called.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// No plugin registered under this id.
    NotRegistered,

    /// Plugin does not implement the requested operation.
    OperationNotSupported,

    /// Plugin does not serve the requested region.
    RegionNotServed,

    /// Circuit breaker is open for this provider and region.
    CircuitOpen,

    /// Admission would require waiting longer than the backoff budget.
    RateLimited { wait_ms: u64 },
}

/// One candidate's fate during an execution.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateOutcome {
    pub provider: ProviderId,
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub success: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDiagnostics {
    pub candidates: Vec<CandidateOutcome>,
}

impl ExecutionDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&mut self, provider: ProviderId, reason: SkipReason) {
        self.candidates.push(CandidateOutcome {
            provider,
            skipped: Some(reason),
            error: None,
            error_kind: None,
            success: false,
        });
    }

    pub fn record_rate_limited(&mut self, provider: ProviderId, wait: Duration) {
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self.record_skip(provider, SkipReason::RateLimited { wait_ms });
    }

    pub fn record_error(&mut self, provider: ProviderId, kind: ErrorKind, error: String) {
        self.candidates.push(CandidateOutcome {
            provider,
            skipped: None,
            error: Some(error),
            error_kind: Some(kind),
            success: false,
        });
    }

    pub fn record_success(&mut self, provider: ProviderId) {
        self.candidates.push(CandidateOutcome {
            provider,
            skipped: None,
            error: None,
            error_kind: None,
            success: true,
        });
    }

    /// One-line trace for logs, e.g. `plaid: SKIPPED (CircuitOpen) -> mx: SUCCESS`.
    pub fn summary(&self) -> String {
        self.candidates
            .iter()
            .map(|c| {
                if c.success {
                    format!("{}: SUCCESS", c.provider)
                } else if let Some(skip) = &c.skipped {
                    format!("{}: SKIPPED ({:?})", c.provider, skip)
                } else if let Some(err) = &c.error {
                    format!("{}: ERROR ({})", c.provider, err)
                } else {
                    format!("{}: UNKNOWN", c.provider)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn has_success(&self) -> bool {
        self.candidates.iter().any(|c| c.success)
    }

    /// Candidates that were actually called.
    pub fn attempted(&self) -> usize {
        self.candidates.iter().filter(|c| c.skipped.is_none()).count()
    }

    pub fn skip_reasons(&self) -> Vec<(&ProviderId, &SkipReason)> {
        self.candidates
            .iter()
            .filter_map(|c| c.skipped.as_ref().map(|s| (&c.provider, s)))
            .collect()
    }

    pub fn errors(&self) -> Vec<(&ProviderId, &str)> {
        self.candidates
            .iter()
            .filter_map(|c| c.error.as_ref().map(|e| (&c.provider, e.as_str())))
            .collect()
    }
}
