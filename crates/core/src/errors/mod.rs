//! Error types and failure classification for provider execution.
//!
//! This module provides:
//! - [`ProviderError`]: the raw failure a provider plugin reports
//! - [`ErrorKind`] / [`ClassifiedError`]: the retry taxonomy the orchestrator acts on
//! - [`StoreError`]: storage-agnostic failures from the health and attempt stores
//! - [`ValidationError`]: rejected input such as an unknown region code

mod classify;

pub use classify::{classify, ClassifiedError, ErrorKind};

use std::time::Duration;

use thiserror::Error;

/// Storage-agnostic error type for the health record and attempt stores.
///
/// Backends convert their own errors (SQL, network, ...) into this format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A read or write failed to execute.
    #[error("Store query failed: {0}")]
    QueryFailed(String),

    /// The requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Internal/unexpected store error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Failure reported by a provider plugin.
///
/// Plugins surface whatever the upstream API told them; the orchestrator
/// maps it onto an [`ErrorKind`] with [`classify`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// HTTP status of the upstream response, when there was one.
    pub status: Option<u16>,
    /// Provider-specific error code (e.g., "ITEM_LOGIN_REQUIRED").
    pub code: Option<String>,
    pub message: String,
    /// Server-supplied wait before retrying (Retry-After).
    pub retry_after: Option<Duration>,
    /// Set when the provider does not implement the requested operation.
    pub unsupported: bool,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
            unsupported: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// The provider does not implement `operation`.
    pub fn not_supported(operation: &str, provider: &str) -> Self {
        Self {
            unsupported: true,
            ..Self::new(format!(
                "Operation '{}' not supported by provider '{}'",
                operation, provider
            ))
        }
    }

    /// The call did not complete within `timeout`.
    pub fn timed_out(provider: &str, timeout: Duration) -> Self {
        Self::new(format!(
            "Request to '{}' timed out after {}ms",
            provider,
            timeout.as_millis()
        ))
        .with_code("TIMEOUT")
    }
}
