//! Identifiers for providers, regions and the (provider, region) key.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// Provider identifier (e.g., "plaid", "truelayer").
pub type ProviderId = Cow<'static, str>;

/// Geographic market a provider serves.
///
/// Provider behaviour (limits, health, defaults) is tracked separately per
/// region because aggregators run regional stacks that fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Us,
    Ca,
    Eu,
    Uk,
    In,
    Global,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Us,
        Region::Ca,
        Region::Eu,
        Region::Uk,
        Region::In,
        Region::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Ca => "ca",
            Region::Eu => "eu",
            Region::Uk => "uk",
            Region::In => "in",
            Region::Global => "global",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "ca" => Ok(Region::Ca),
            "eu" => Ok(Region::Eu),
            "uk" | "gb" => Ok(Region::Uk),
            "in" => Ok(Region::In),
            "global" => Ok(Region::Global),
            other => Err(ValidationError::InvalidInput(format!(
                "unknown region '{}'",
                other
            ))),
        }
    }
}

/// Key for all per-provider, per-region state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderKey {
    pub provider: ProviderId,
    pub region: Region,
}

impl ProviderKey {
    pub fn new(provider: impl Into<ProviderId>, region: Region) -> Self {
        Self {
            provider: provider.into(),
            region,
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.region)
    }
}
