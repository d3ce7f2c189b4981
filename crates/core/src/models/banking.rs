//! Request parameters and payloads exchanged with aggregator providers.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::Region;

// =============================================================================
// Link / token exchange
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkParams {
    pub user_id: String,
    pub institution_id: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

/// Short-lived token the client UI uses to start the provider's link flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSession {
    pub link_token: String,
    pub link_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeTokenParams {
    pub user_id: String,
    pub public_token: String,
}

/// Long-lived credentials returned by a completed link flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub access_token: String,
    pub item_id: String,
    pub institution_id: Option<String>,
}

// =============================================================================
// Accounts / transactions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAccountsParams {
    pub access_token: String,
    #[serde(default)]
    pub account_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedAccount {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub currency: String,
    pub current_balance: Option<Decimal>,
    pub available_balance: Option<Decimal>,
    pub mask: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTransactionsParams {
    pub access_token: String,
    pub cursor: Option<String>,
    pub since: Option<NaiveDate>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTransaction {
    pub id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub booked_on: NaiveDate,
    pub pending: bool,
}

/// One page of an incremental transaction sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub added: Vec<ProviderTransaction>,
    pub modified: Vec<ProviderTransaction>,
    pub removed: Vec<String>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

// =============================================================================
// Webhooks / institutions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub event_type: String,
    pub item_id: Option<String>,
    pub requires_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstitutionQuery {
    pub query: String,
    pub region: Region,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub url: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

/// Result of a provider's own liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub healthy: bool,
    pub message: Option<String>,
}
