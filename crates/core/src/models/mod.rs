//! Domain models for provider execution.

mod attempt;
mod banking;
mod health;
mod ids;
mod operation;

pub use attempt::{AttemptStatus, ConnectionAttempt};
pub use banking::{
    AccessGrant, CreateLinkParams, ExchangeTokenParams, GetAccountsParams, Institution,
    InstitutionQuery, LinkSession, LinkedAccount, ProviderStatus, ProviderTransaction,
    SyncTransactionsParams, TransactionPage, WebhookOutcome, WebhookPayload,
};
pub use health::{CircuitState, HealthStatus, ProviderHealthRecord};
pub use ids::{ProviderId, ProviderKey, Region};
pub use operation::{Operation, ProviderRequest, ProviderResponse};
