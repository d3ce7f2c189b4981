//! Collaborator traits for persistence and routing.
//!
//! - `HealthRecordStore` - per-(provider, region) health records with atomic updates
//! - `AttemptLog` - append-only connection attempt history
//! - `InstitutionRouting` - institution to provider mapping

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::models::{ConnectionAttempt, ProviderHealthRecord, ProviderId, ProviderKey, Region};

// =============================================================================
// Health Records
// =============================================================================

/// Storage for provider health records.
///
/// Implementations must make [`update`](Self::update) atomic per key: two
/// concurrent updates of the same key never interleave, while updates of
/// different keys need not serialize against each other.
pub trait HealthRecordStore: Send + Sync {
    fn get(&self, key: &ProviderKey) -> Result<Option<ProviderHealthRecord>, StoreError>;

    fn list_for_region(&self, region: Region) -> Result<Vec<ProviderHealthRecord>, StoreError>;

    /// Read-modify-write of one record.
    ///
    /// A missing record is created with `ProviderHealthRecord::new(key, now)`
    /// before `apply` runs. Returns the record as stored after `apply`.
    fn update(
        &self,
        key: &ProviderKey,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut ProviderHealthRecord),
    ) -> Result<ProviderHealthRecord, StoreError>;

    fn remove(&self, key: &ProviderKey) -> Result<(), StoreError>;
}

// =============================================================================
// Attempt Log
// =============================================================================

/// Append-only log of connection attempts.
#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn append(&self, attempt: ConnectionAttempt) -> Result<(), StoreError>;

    /// Most recent attempts for an account/institution context, newest first.
    async fn history_for_context(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError>;

    /// Most recent attempts for one provider in one region made at or after
    /// `since`, newest first.
    async fn history_for_provider(
        &self,
        key: &ProviderKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError>;
}

// =============================================================================
// Institution Routing
// =============================================================================

/// Providers able to serve one institution, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstitutionRoute {
    pub primary: ProviderId,
    #[serde(default)]
    pub backups: Vec<ProviderId>,
}

impl InstitutionRoute {
    /// Primary followed by backups.
    pub fn providers(&self) -> Vec<ProviderId> {
        std::iter::once(self.primary.clone())
            .chain(self.backups.iter().cloned())
            .collect()
    }
}

/// Resolves an institution to the providers that can reach it.
pub trait InstitutionRouting: Send + Sync {
    /// `Ok(None)` means no mapping; callers fall back to region defaults.
    fn route(
        &self,
        institution_id: &str,
        region: Region,
    ) -> Result<Option<InstitutionRoute>, StoreError>;
}
