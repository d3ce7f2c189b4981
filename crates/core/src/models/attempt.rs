//! Connection attempt log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{ProviderId, Region};
use super::operation::Operation;
use crate::errors::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
}

/// One orchestrator attempt against one provider. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAttempt {
    pub id: Uuid,
    pub provider: ProviderId,
    pub region: Region,
    pub operation: Operation,
    /// Account or institution the attempt was made for, if any.
    pub context_id: Option<String>,
    pub status: AttemptStatus,
    pub error_code: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub failover_used: bool,
    pub attempted_at: DateTime<Utc>,
}

impl ConnectionAttempt {
    pub fn success(
        provider: ProviderId,
        region: Region,
        operation: Operation,
        context_id: Option<String>,
        response_time_ms: u64,
        failover_used: bool,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            provider,
            region,
            operation,
            context_id,
            status: AttemptStatus::Success,
            error_code: None,
            error_message: None,
            response_time_ms: Some(response_time_ms),
            failover_used,
            attempted_at,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn failure(
        provider: ProviderId,
        region: Region,
        operation: Operation,
        context_id: Option<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        response_time_ms: Option<u64>,
        failover_used: bool,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            provider,
            region,
            operation,
            context_id,
            status: AttemptStatus::Failure,
            error_code: Some(kind),
            error_message: Some(message.into()),
            response_time_ms,
            failover_used,
            attempted_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}
