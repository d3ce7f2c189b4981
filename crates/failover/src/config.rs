//! Failover configuration.
//!
//! Everything has a default, so an empty JSON object (or no configuration at
//! all) yields a working setup. Environment variables override individual
//! circuit breaker and timeout settings on top of an optional JSON file.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use finlink_core::{ProviderId, RateLimitPolicy, Region};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::scorer::ScoringConfig;

/// Path to a JSON configuration document.
pub const ENV_CONFIG_FILE: &str = "FINLINK_CONFIG_FILE";
pub const ENV_CB_FAILURE_THRESHOLD: &str = "FINLINK_CB_FAILURE_THRESHOLD";
pub const ENV_CB_TIMEOUT_SECS: &str = "FINLINK_CB_TIMEOUT_SECS";
pub const ENV_CB_WINDOW_SECS: &str = "FINLINK_CB_WINDOW_SECS";
pub const ENV_ATTEMPT_TIMEOUT_MS: &str = "FINLINK_ATTEMPT_TIMEOUT_MS";

const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

// =============================================================================
// Region Defaults
// =============================================================================

/// Static provider preference per region, used when no institution route or
/// score is available.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionDefaults(HashMap<Region, Vec<ProviderId>>);

impl RegionDefaults {
    pub fn new(table: HashMap<Region, Vec<ProviderId>>) -> Self {
        Self(table)
    }

    /// Providers for `region` in preference order. Regions without an entry
    /// use the global list.
    pub fn providers(&self, region: Region) -> Vec<ProviderId> {
        self.0
            .get(&region)
            .or_else(|| self.0.get(&Region::Global))
            .cloned()
            .unwrap_or_default()
    }

    pub fn primary(&self, region: Region) -> Option<ProviderId> {
        self.providers(region).into_iter().next()
    }
}

impl Default for RegionDefaults {
    fn default() -> Self {
        fn list(ids: &[&'static str]) -> Vec<ProviderId> {
            ids.iter().map(|id| Cow::Borrowed(*id)).collect()
        }

        let table = HashMap::from([
            (Region::Us, list(&["plaid", "mx", "finicity", "teller"])),
            (Region::Ca, list(&["plaid", "mx", "finicity"])),
            (Region::Eu, list(&["truelayer", "saltedge", "plaid"])),
            (Region::Uk, list(&["truelayer", "plaid", "saltedge"])),
            (Region::In, list(&["setu", "saltedge"])),
            (Region::Global, list(&["saltedge", "plaid"])),
        ]);
        Self(table)
    }
}

// =============================================================================
// Failover Config
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-provider overrides of the tier rate limit policy, keyed by provider id.
    pub rate_limits: HashMap<String, RateLimitPolicy>,
    pub scoring: ScoringConfig,
    pub region_defaults: RegionDefaults,
    /// Upper bound for a single provider call.
    pub attempt_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limits: HashMap::new(),
            scoring: ScoringConfig::default(),
            region_defaults: RegionDefaults::default(),
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
        }
    }
}

impl FailoverConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE).filter(|p| !p.trim().is_empty()) {
            Some(path) => {
                debug!("Loading failover config from '{}'", path);
                Self::from_file(path.trim())?
            }
            None => Self::default(),
        };

        if let Some(threshold) = parse_var::<u32, _>(&lookup, ENV_CB_FAILURE_THRESHOLD)? {
            config.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CB_TIMEOUT_SECS)? {
            config.circuit_breaker.timeout_secs = secs;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CB_WINDOW_SECS)? {
            config.circuit_breaker.window_secs = secs;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_ATTEMPT_TIMEOUT_MS)? {
            config.attempt_timeout_ms = ms;
        }

        Ok(config)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Rate limit override for `provider`, if one is configured.
    pub fn rate_limit_override(&self, provider: &str) -> Option<&RateLimitPolicy> {
        self.rate_limits.get(provider)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FailoverConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.timeout_secs, 60);
        assert_eq!(config.circuit_breaker.window_secs, 300);
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.region_defaults.providers(Region::Uk),
            vec!["truelayer", "plaid", "saltedge"]
        );
        assert_eq!(config.region_defaults.primary(Region::In).as_deref(), Some("setu"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FailoverConfig::from_json_str(
            r#"{
                "circuit_breaker": { "failure_threshold": 3 },
                "rate_limits": { "teller": { "requests_per_minute": 10 } },
                "attempt_timeout_ms": 5000
            }"#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_secs, 60);
        let teller = config.rate_limit_override("teller").unwrap();
        assert_eq!(teller.requests_per_minute, 10);
        assert_eq!(teller.requests_per_hour, 1000);
        assert!(config.rate_limit_override("plaid").is_none());
        assert_eq!(config.attempt_timeout_ms, 5000);
        assert_eq!(config.region_defaults, RegionDefaults::default());
    }

    #[test]
    fn test_region_defaults_from_json() {
        let config = FailoverConfig::from_json_str(
            r#"{ "region_defaults": { "us": ["mx"], "global": ["plaid"] } }"#,
        )
        .unwrap();
        assert_eq!(config.region_defaults.providers(Region::Us), vec!["mx"]);
        assert_eq!(config.region_defaults.providers(Region::Eu), vec!["plaid"]);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            (ENV_CB_FAILURE_THRESHOLD, "8"),
            (ENV_CB_TIMEOUT_SECS, " 120 "),
            (ENV_ATTEMPT_TIMEOUT_MS, "2500"),
        ]);
        let config =
            FailoverConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 8);
        assert_eq!(config.circuit_breaker.timeout_secs, 120);
        assert_eq!(config.circuit_breaker.window_secs, 300);
        assert_eq!(config.attempt_timeout_ms, 2500);
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let result = FailoverConfig::from_lookup(|name| {
            (name == ENV_CB_WINDOW_SECS).then(|| "five minutes".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                name: ENV_CB_WINDOW_SECS,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let result = FailoverConfig::from_lookup(|name| {
            (name == ENV_CONFIG_FILE).then(|| "/nonexistent/finlink.json".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            FailoverConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
