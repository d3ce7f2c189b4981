//! Operations the execution core can route to a provider.

use serde::{Deserialize, Serialize};

use super::banking::{
    AccessGrant, CreateLinkParams, ExchangeTokenParams, GetAccountsParams, Institution,
    InstitutionQuery, LinkSession, LinkedAccount, ProviderStatus, SyncTransactionsParams,
    TransactionPage, WebhookOutcome, WebhookPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    HealthCheck,
    CreateLink,
    ExchangeToken,
    GetAccounts,
    SyncTransactions,
    HandleWebhook,
    SearchInstitutions,
    GetInstitution,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::HealthCheck,
        Operation::CreateLink,
        Operation::ExchangeToken,
        Operation::GetAccounts,
        Operation::SyncTransactions,
        Operation::HandleWebhook,
        Operation::SearchInstitutions,
        Operation::GetInstitution,
    ];

    /// Operations every provider plugin must implement.
    pub const REQUIRED: [Operation; 5] = [
        Operation::HealthCheck,
        Operation::CreateLink,
        Operation::ExchangeToken,
        Operation::GetAccounts,
        Operation::SyncTransactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::HealthCheck => "health_check",
            Operation::CreateLink => "create_link",
            Operation::ExchangeToken => "exchange_token",
            Operation::GetAccounts => "get_accounts",
            Operation::SyncTransactions => "sync_transactions",
            Operation::HandleWebhook => "handle_webhook",
            Operation::SearchInstitutions => "search_institutions",
            Operation::GetInstitution => "get_institution",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum ProviderRequest {
    HealthCheck,
    CreateLink(CreateLinkParams),
    ExchangeToken(ExchangeTokenParams),
    GetAccounts(GetAccountsParams),
    SyncTransactions(SyncTransactionsParams),
    HandleWebhook(WebhookPayload),
    SearchInstitutions(InstitutionQuery),
    GetInstitution { institution_id: String },
}

impl ProviderRequest {
    pub fn operation(&self) -> Operation {
        match self {
            ProviderRequest::HealthCheck => Operation::HealthCheck,
            ProviderRequest::CreateLink(_) => Operation::CreateLink,
            ProviderRequest::ExchangeToken(_) => Operation::ExchangeToken,
            ProviderRequest::GetAccounts(_) => Operation::GetAccounts,
            ProviderRequest::SyncTransactions(_) => Operation::SyncTransactions,
            ProviderRequest::HandleWebhook(_) => Operation::HandleWebhook,
            ProviderRequest::SearchInstitutions(_) => Operation::SearchInstitutions,
            ProviderRequest::GetInstitution { .. } => Operation::GetInstitution,
        }
    }
}

/// Payload returned by a successful provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "data", rename_all = "snake_case")]
pub enum ProviderResponse {
    HealthCheck(ProviderStatus),
    CreateLink(LinkSession),
    ExchangeToken(AccessGrant),
    GetAccounts(Vec<LinkedAccount>),
    SyncTransactions(TransactionPage),
    HandleWebhook(WebhookOutcome),
    SearchInstitutions(Vec<Institution>),
    GetInstitution(Institution),
}

impl ProviderResponse {
    pub fn operation(&self) -> Operation {
        match self {
            ProviderResponse::HealthCheck(_) => Operation::HealthCheck,
            ProviderResponse::CreateLink(_) => Operation::CreateLink,
            ProviderResponse::ExchangeToken(_) => Operation::ExchangeToken,
            ProviderResponse::GetAccounts(_) => Operation::GetAccounts,
            ProviderResponse::SyncTransactions(_) => Operation::SyncTransactions,
            ProviderResponse::HandleWebhook(_) => Operation::HandleWebhook,
            ProviderResponse::SearchInstitutions(_) => Operation::SearchInstitutions,
            ProviderResponse::GetInstitution(_) => Operation::GetInstitution,
        }
    }
}
