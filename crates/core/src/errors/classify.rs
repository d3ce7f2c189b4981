//! Retry taxonomy for provider failures.
//!
//! | Kind | Retryable | Meaning |
//! |------|-----------|---------|
//! | `Auth` | No | Credentials invalid or expired; needs user action |
//! | `Validation` | No | Malformed request |
//! | `RateLimit` | Yes | Provider-side throttling |
//! | `Network` | Yes | Timeout or connection failure |
//! | `ProviderDown` | Yes | Maintenance or outage |
//! | `Unknown` | No | Unclassified |

use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Validation,
    RateLimit,
    Network,
    ProviderDown,
    Unknown,
}

impl ErrorKind {
    /// Whether the orchestrator may move on to the next candidate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::ProviderDown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::ProviderDown => "provider_down",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
    pub retry_after_ms: Option<u64>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
            code: None,
            status: None,
            retry_after_ms: None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

lazy_static! {
    static ref RATE_LIMIT_PATTERN: Regex = Regex::new(
        r"(?i)rate[ _-]?limit|too many requests|throttl|quota[ _-]?exceeded|\b429\b"
    )
    .expect("rate limit pattern");
    static ref AUTH_PATTERN: Regex = Regex::new(
        r"(?i)invalid[ _-]?credentials|unauthori[sz]ed|forbidden|access[ _-]?denied|invalid[ _-]?(access[ _-]?)?token|invalid[ _-]?api[ _-]?key|expired[ _-]?token|token[ _-]?expired|login[ _-]?required|authenticat|\b40[13]\b"
    )
    .expect("auth pattern");
    static ref PROVIDER_DOWN_PATTERN: Regex = Regex::new(
        r"(?i)maintenance|unavailable|institution[ _-]?down|service[ _-]?down|outage|bad gateway|internal server error|\b50[023]\b"
    )
    .expect("provider down pattern");
    static ref NETWORK_PATTERN: Regex = Regex::new(
        r"(?i)timed?[ _-]?out|timeout|connection[ _-]?(reset|refused|closed|aborted|failed)|econn(reset|refused|aborted)|enotfound|etimedout|dns|socket hang up|broken pipe|unreachable|network"
    )
    .expect("network pattern");
    static ref VALIDATION_PATTERN: Regex = Regex::new(
        r"(?i)invalid[ _-]?(request|input|param|field|argument|format)|validation|malformed|missing[ _-]?required|bad request|unprocessable|\b(400|422)\b"
    )
    .expect("validation pattern");
}

fn kind_from_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Auth),
        400 | 404 | 422 => Some(ErrorKind::Validation),
        429 => Some(ErrorKind::RateLimit),
        408 | 504 => Some(ErrorKind::Network),
        500 | 502 | 503 => Some(ErrorKind::ProviderDown),
        _ => None,
    }
}

fn kind_from_text(text: &str) -> ErrorKind {
    if RATE_LIMIT_PATTERN.is_match(text) {
        ErrorKind::RateLimit
    } else if AUTH_PATTERN.is_match(text) {
        ErrorKind::Auth
    } else if PROVIDER_DOWN_PATTERN.is_match(text) {
        ErrorKind::ProviderDown
    } else if NETWORK_PATTERN.is_match(text) {
        ErrorKind::Network
    } else if VALIDATION_PATTERN.is_match(text) {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

/// Classifies a provider failure.
///
/// The upstream HTTP status wins when it maps to a kind; otherwise the code
/// and message are matched against known patterns.
///
/// # Examples
///
/// ```
/// use finlink_core::errors::{classify, ErrorKind, ProviderError};
///
/// let error = ProviderError::new("Invalid credentials supplied");
/// assert_eq!(classify(&error).kind, ErrorKind::Auth);
///
/// let error = ProviderError::new("connection reset by peer");
/// assert!(classify(&error).retryable);
/// ```
pub fn classify(error: &ProviderError) -> ClassifiedError {
    let kind = error.status.and_then(kind_from_status).unwrap_or_else(|| {
        let haystack = match &error.code {
            Some(code) => format!("{} {}", code, error.message),
            None => error.message.clone(),
        };
        kind_from_text(&haystack)
    });
    if kind == ErrorKind::Unknown {
        debug!("Unclassified provider error: {}", error.message);
    }

    ClassifiedError {
        kind,
        retryable: kind.is_retryable(),
        message: error.message.clone(),
        code: error.code.clone(),
        status: error.status,
        retry_after_ms: error.retry_after.map(|d| d.as_millis() as u64),
    }
}
