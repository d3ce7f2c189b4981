//! Bounded in-memory attempt log.

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

use finlink_core::{AttemptLog, ConnectionAttempt, ProviderKey, StoreError};

/// Default number of attempts retained before the oldest are dropped.
const DEFAULT_RETENTION: usize = 10_000;

/// Append-only attempt log that keeps the most recent `retention` entries.
#[derive(Debug)]
pub struct MemoryAttemptLog {
    attempts: RwLock<VecDeque<ConnectionAttempt>>,
    retention: usize,
}

impl MemoryAttemptLog {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            attempts: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<ConnectionAttempt>> {
        self.attempts.read().unwrap_or_else(|poisoned| {
            warn!("Attempt log lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<ConnectionAttempt>> {
        self.attempts.write().unwrap_or_else(|poisoned| {
            warn!("Attempt log lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Snapshot of every retained attempt, oldest first.
    pub fn all(&self) -> Vec<ConnectionAttempt> {
        self.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn newest_matching<F>(&self, limit: usize, predicate: F) -> Vec<ConnectionAttempt>
    where
        F: Fn(&ConnectionAttempt) -> bool,
    {
        let mut matches: Vec<_> = self
            .read()
            .iter()
            .filter(|a| predicate(a))
            .cloned()
            .collect();
        // Appends are not guaranteed to arrive in attempt order under concurrency.
        matches.sort_by(|a, b| b.attempted_at.cmp(&a.attempted_at));
        matches.truncate(limit);
        matches
    }
}

impl Default for MemoryAttemptLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttemptLog for MemoryAttemptLog {
    async fn append(&self, attempt: ConnectionAttempt) -> Result<(), StoreError> {
        let mut attempts = self.write();
        attempts.push_back(attempt);
        while attempts.len() > self.retention {
            attempts.pop_front();
        }
        Ok(())
    }

    async fn history_for_context(
        &self,
        context_id: &str,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError> {
        Ok(self.newest_matching(limit, |a| a.context_id.as_deref() == Some(context_id)))
    }

    async fn history_for_provider(
        &self,
        key: &ProviderKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectionAttempt>, StoreError> {
        Ok(self.newest_matching(limit, |a| {
            a.provider == key.provider && a.region == key.region && a.attempted_at >= since
        }))
    }
}
