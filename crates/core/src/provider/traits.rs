//! Provider plugin trait definition.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::models::{
    AccessGrant, CreateLinkParams, ExchangeTokenParams, GetAccountsParams, Institution,
    InstitutionQuery, LinkSession, LinkedAccount, ProviderRequest, ProviderResponse,
    ProviderStatus, SyncTransactionsParams, TransactionPage, WebhookOutcome, WebhookPayload,
};

use super::capabilities::{ProviderCapabilities, ProviderTier, RateLimitPolicy};

/// Trait for aggregator provider plugins.
///
/// Implement this trait to add support for a new data aggregator. The
/// orchestrator only ever sees this trait; plugins are registered by
/// [`id`](Self::id) at startup.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use finlink_core::provider::{ProviderCapabilities, ProviderPlugin, ProviderTier};
///
/// struct PlaidPlugin {
///     client: PlaidClient,
/// }
///
/// #[async_trait]
/// impl ProviderPlugin for PlaidPlugin {
///     fn id(&self) -> &'static str {
///         "plaid"
///     }
///
///     fn tier(&self) -> ProviderTier {
///         ProviderTier::HighVolume
///     }
///
///     fn capabilities(&self) -> ProviderCapabilities {
///         ProviderCapabilities {
///             operations: &Operation::ALL,
///             regions: &[Region::Us, Region::Ca, Region::Eu, Region::Uk],
///         }
///     }
///
///     // ... implement the required operations
/// }
/// ```
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    /// Unique identifier, e.g. "plaid". Used as the registry key and in
    /// every health record and attempt log entry.
    fn id(&self) -> &'static str;

    /// Contracted volume tier; selects the default rate limit policy.
    fn tier(&self) -> ProviderTier {
        ProviderTier::Standard
    }

    /// Rate limit policy. Defaults to the tier preset.
    fn rate_limit(&self) -> RateLimitPolicy {
        RateLimitPolicy::for_tier(self.tier())
    }

    fn capabilities(&self) -> ProviderCapabilities;

    async fn health_check(&self) -> Result<ProviderStatus, ProviderError>;

    async fn create_link(&self, params: &CreateLinkParams) -> Result<LinkSession, ProviderError>;

    async fn exchange_token(
        &self,
        params: &ExchangeTokenParams,
    ) -> Result<AccessGrant, ProviderError>;

    async fn get_accounts(
        &self,
        params: &GetAccountsParams,
    ) -> Result<Vec<LinkedAccount>, ProviderError>;

    async fn sync_transactions(
        &self,
        params: &SyncTransactionsParams,
    ) -> Result<TransactionPage, ProviderError>;

    /// Default implementation returns a not-supported error.
    async fn handle_webhook(
        &self,
        payload: &WebhookPayload,
    ) -> Result<WebhookOutcome, ProviderError> {
        let _ = payload;
        Err(ProviderError::not_supported("handle_webhook", self.id()))
    }

    /// Default implementation returns a not-supported error.
    async fn search_institutions(
        &self,
        query: &InstitutionQuery,
    ) -> Result<Vec<Institution>, ProviderError> {
        let _ = query;
        Err(ProviderError::not_supported("search_institutions", self.id()))
    }

    /// Default implementation returns a not-supported error.
    async fn get_institution(&self, institution_id: &str) -> Result<Institution, ProviderError> {
        let _ = institution_id;
        Err(ProviderError::not_supported("get_institution", self.id()))
    }
}

/// Routes a request to the matching plugin method.
pub async fn dispatch(
    plugin: &dyn ProviderPlugin,
    request: &ProviderRequest,
) -> Result<ProviderResponse, ProviderError> {
    match request {
        ProviderRequest::HealthCheck => plugin
            .health_check()
            .await
            .map(ProviderResponse::HealthCheck),
        ProviderRequest::CreateLink(params) => plugin
            .create_link(params)
            .await
            .map(ProviderResponse::CreateLink),
        ProviderRequest::ExchangeToken(params) => plugin
            .exchange_token(params)
            .await
            .map(ProviderResponse::ExchangeToken),
        ProviderRequest::GetAccounts(params) => plugin
            .get_accounts(params)
            .await
            .map(ProviderResponse::GetAccounts),
        ProviderRequest::SyncTransactions(params) => plugin
            .sync_transactions(params)
            .await
            .map(ProviderResponse::SyncTransactions),
        ProviderRequest::HandleWebhook(payload) => plugin
            .handle_webhook(payload)
            .await
            .map(ProviderResponse::HandleWebhook),
        ProviderRequest::SearchInstitutions(query) => plugin
            .search_institutions(query)
            .await
            .map(ProviderResponse::SearchInstitutions),
        ProviderRequest::GetInstitution { institution_id } => plugin
            .get_institution(institution_id)
            .await
            .map(ProviderResponse::GetInstitution),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operation, Region};

    struct ManualSource;

    #[async_trait]
    impl ProviderPlugin for ManualSource {
        fn id(&self) -> &'static str {
            "manual"
        }

        fn tier(&self) -> ProviderTier {
            ProviderTier::Internal
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                operations: &Operation::REQUIRED,
                regions: &Region::ALL,
            }
        }

        async fn health_check(&self) -> Result<ProviderStatus, ProviderError> {
            Ok(ProviderStatus {
                healthy: true,
                message: None,
            })
        }

        async fn create_link(
            &self,
            params: &CreateLinkParams,
        ) -> Result<LinkSession, ProviderError> {
            Ok(LinkSession {
                link_token: format!("manual-{}", params.user_id),
                link_url: None,
                expires_at: None,
            })
        }

        async fn exchange_token(
            &self,
            params: &ExchangeTokenParams,
        ) -> Result<AccessGrant, ProviderError> {
            Ok(AccessGrant {
                access_token: params.public_token.clone(),
                item_id: "manual-item".to_string(),
                institution_id: None,
            })
        }

        async fn get_accounts(
            &self,
            _params: &GetAccountsParams,
        ) -> Result<Vec<LinkedAccount>, ProviderError> {
            Ok(Vec::new())
        }

        async fn sync_transactions(
            &self,
            _params: &SyncTransactionsParams,
        ) -> Result<TransactionPage, ProviderError> {
            Ok(TransactionPage::default())
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_plugin_method() {
        let request = ProviderRequest::CreateLink(CreateLinkParams {
            user_id: "u-42".to_string(),
            institution_id: None,
            redirect_uri: None,
            products: vec![],
        });

        let response = dispatch(&ManualSource, &request).await.unwrap();
        match response {
            ProviderResponse::CreateLink(session) => assert_eq!(session.link_token, "manual-u-42"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_optional_operations_default_to_not_supported() {
        let request = ProviderRequest::GetInstitution {
            institution_id: "ins_9".to_string(),
        };
        let error = dispatch(&ManualSource, &request).await.unwrap_err();
        assert!(error.unsupported);
    }

    #[test]
    fn test_rate_limit_follows_tier() {
        assert_eq!(ManualSource.rate_limit().requests_per_minute, 1000);
    }
}
