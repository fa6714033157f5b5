//! Credential Strategies
//!
//! One strategy per transport, selected once at startup. The conversation
//! state machine asks its strategy how to authenticate requests, whether a
//! forward may proceed, and which remedy (checkout or authorization) to
//! offer otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use chat_core::{Gateway, RequestAuth, RouterAction, Transport};
use url::Url;

use crate::checkout::{CheckoutConfig, CheckoutReturn};
use crate::credential::CredentialStore;
use crate::error::Result;
use crate::oauth::{CallbackParams, Navigation, OAuthClient};

/// How to get the user to a usable credential
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Remedy {
    /// Buy credits (API-key credential)
    Checkout,
    /// Run the OAuth flow
    Authorize,
    /// Authenticated, but the plan is out of credits
    Exhausted,
}

/// Strategy trait for the active credential kind
#[async_trait]
pub trait CredentialStrategy: Send + Sync {
    fn transport(&self) -> Transport;

    /// Headers material for gateway calls
    fn request_auth(&self) -> RequestAuth;

    /// Whether a credential is held at all
    fn is_authenticated(&self) -> bool;

    /// Local re-check before acting on a `forward` decision
    fn can_forward(&self, credits: Option<i64>) -> bool;

    /// Remedy for a blocking router action (or a failed local re-check)
    fn remedy(&self, action: RouterAction) -> Remedy;

    /// URL the user has to visit for `remedy`, built without navigating
    async fn remedy_url(&self, remedy: Remedy) -> Result<Url>;

    /// Start-mode entry point: navigate to the remedy immediately
    async fn connect(&self) -> Result<Navigation>;

    /// Balance for the badge; `None` without a credential or on failure
    async fn refresh_credits(&self, gateway: &dyn Gateway) -> Option<i64> {
        if !self.is_authenticated() {
            return None;
        }
        match gateway.fetch_credits(&self.request_auth()).await {
            Ok(credits) => credits,
            Err(e) => {
                tracing::warn!(error = %e, "Credit refresh failed");
                None
            }
        }
    }

    /// Persist what checkout handed back; true when a credential arrived
    fn accept_checkout_return(&self, returned: &CheckoutReturn) -> Result<bool>;

    /// Finish an authorization callback; `Ok(false)` when not applicable
    async fn complete_callback(&self, params: &CallbackParams) -> Result<bool>;

    /// Drop any in-flight authorization material
    fn reset_authorization(&self) -> Result<()>;

    fn logout(&self) -> Result<Navigation>;
}

// ── API key ─────────────────────────────────────────────────────────────────

/// API key + credit checkout (the HTTP transport)
pub struct ApiKeyStrategy {
    credentials: Arc<CredentialStore>,
    checkout: CheckoutConfig,
}

impl ApiKeyStrategy {
    pub fn new(credentials: Arc<CredentialStore>, checkout: CheckoutConfig) -> Self {
        Self { credentials, checkout }
    }

    fn api_key(&self) -> Option<String> {
        self.credentials.api_key().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read API key");
            None
        })
    }
}

#[async_trait]
impl CredentialStrategy for ApiKeyStrategy {
    fn transport(&self) -> Transport {
        self.credentials.transport()
    }

    fn request_auth(&self) -> RequestAuth {
        self.credentials.request_auth()
    }

    fn is_authenticated(&self) -> bool {
        self.api_key().is_some()
    }

    /// Unknown credits do not block; only a confirmed empty balance does
    fn can_forward(&self, credits: Option<i64>) -> bool {
        self.is_authenticated() && !matches!(credits, Some(c) if c <= 0)
    }

    fn remedy(&self, _action: RouterAction) -> Remedy {
        Remedy::Checkout
    }

    async fn remedy_url(&self, _remedy: Remedy) -> Result<Url> {
        self.checkout.checkout_url(!self.is_authenticated())
    }

    async fn connect(&self) -> Result<Navigation> {
        let url = self.remedy_url(Remedy::Checkout).await?;
        Ok(Navigation::Assign(url.into()))
    }

    fn accept_checkout_return(&self, returned: &CheckoutReturn) -> Result<bool> {
        if let Some(api_key) = returned.api_key.as_deref() {
            self.credentials
                .store_api_key(api_key, returned.plan_id.as_deref())?;
            return Ok(true);
        }
        if let Some(plan_id) = returned.plan_id.as_deref() {
            self.credentials.store_plan_id(plan_id)?;
        }
        Ok(false)
    }

    async fn complete_callback(&self, _params: &CallbackParams) -> Result<bool> {
        Ok(false)
    }

    fn reset_authorization(&self) -> Result<()> {
        Ok(())
    }

    fn logout(&self) -> Result<Navigation> {
        self.credentials.clear_api_key()?;
        Ok(Navigation::Assign("/".into()))
    }
}

// ── OAuth ───────────────────────────────────────────────────────────────────

/// OAuth 2.1 + PKCE against the MCP server (the MCP transport)
pub struct OAuthStrategy {
    credentials: Arc<CredentialStore>,
    client: Arc<OAuthClient>,
}

impl OAuthStrategy {
    pub fn new(credentials: Arc<CredentialStore>, client: Arc<OAuthClient>) -> Self {
        Self { credentials, client }
    }

    pub fn client(&self) -> &OAuthClient {
        &self.client
    }
}

#[async_trait]
impl CredentialStrategy for OAuthStrategy {
    fn transport(&self) -> Transport {
        self.credentials.transport()
    }

    fn request_auth(&self) -> RequestAuth {
        self.credentials.request_auth()
    }

    fn is_authenticated(&self) -> bool {
        self.client.is_authenticated()
    }

    fn can_forward(&self, _credits: Option<i64>) -> bool {
        self.is_authenticated()
    }

    fn remedy(&self, action: RouterAction) -> Remedy {
        match action {
            RouterAction::NoCredit | RouterAction::OrderPlan if self.is_authenticated() => Remedy::Exhausted,
            _ => Remedy::Authorize,
        }
    }

    async fn remedy_url(&self, _remedy: Remedy) -> Result<Url> {
        self.client.prepare_authorization_url().await
    }

    async fn connect(&self) -> Result<Navigation> {
        self.client.start_authorization_flow().await
    }

    /// Only the plan id is kept; this transport never holds an API key
    fn accept_checkout_return(&self, returned: &CheckoutReturn) -> Result<bool> {
        if let Some(plan_id) = returned.plan_id.as_deref() {
            self.credentials.store_plan_id(plan_id)?;
        }
        Ok(false)
    }

    async fn complete_callback(&self, params: &CallbackParams) -> Result<bool> {
        self.client.complete_authorization_flow(params).await
    }

    fn reset_authorization(&self) -> Result<()> {
        self.client.reset_session()
    }

    fn logout(&self) -> Result<Navigation> {
        self.client.logout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpClient;
    use crate::oauth::OAuthConfig;
    use chat_core::{KeyValueStore, MemoryStore, MockGateway};

    fn api_key_strategy() -> (Arc<MemoryStore>, ApiKeyStrategy) {
        let durable = Arc::new(MemoryStore::new());
        let credentials = Arc::new(CredentialStore::new(
            durable.clone(),
            Arc::new(MemoryStore::new()),
            Transport::Http,
        ));
        let checkout = CheckoutConfig::new("agent-1", "http://localhost:8080/callback");
        (durable, ApiKeyStrategy::new(credentials, checkout))
    }

    fn oauth_strategy() -> (Arc<MemoryStore>, OAuthStrategy) {
        let durable = Arc::new(MemoryStore::new());
        let credentials = Arc::new(CredentialStore::new(
            durable.clone(),
            Arc::new(MemoryStore::new()),
            Transport::Mcp,
        ));
        let client = Arc::new(OAuthClient::new(
            OAuthConfig::new("http://localhost:4002", "http://localhost:8080/callback"),
            Arc::new(MockHttpClient::new()),
            credentials.clone(),
        ));
        (durable, OAuthStrategy::new(credentials, client))
    }

    #[test]
    fn test_api_key_forward_check() {
        let (durable, strategy) = api_key_strategy();
        assert!(!strategy.can_forward(None));

        durable.set("nvmApiKey", "ABC").unwrap();
        assert!(strategy.can_forward(None));
        assert!(strategy.can_forward(Some(3)));
        assert!(!strategy.can_forward(Some(0)));
        assert_eq!(strategy.remedy(RouterAction::Authorize), Remedy::Checkout);
    }

    #[tokio::test]
    async fn test_checkout_url_exports_key_only_when_missing() {
        let (durable, strategy) = api_key_strategy();
        let url = strategy.remedy_url(Remedy::Checkout).await.unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "export" && v == "nvm-api-key"));

        durable.set("nvmApiKey", "ABC").unwrap();
        let url = strategy.remedy_url(Remedy::Checkout).await.unwrap();
        assert!(url.query_pairs().all(|(k, _)| k != "export"));
    }

    #[test]
    fn test_checkout_return_stores_key() {
        let (durable, strategy) = api_key_strategy();
        let returned = CheckoutReturn {
            api_key: Some("ABC".into()),
            plan_id: Some("XYZ".into()),
        };
        assert!(strategy.accept_checkout_return(&returned).unwrap());

        let auth = strategy.request_auth();
        assert_eq!(auth.bearer.as_deref(), Some("ABC"));
        assert_eq!(auth.plan_id.as_deref(), Some("XYZ"));
        assert_eq!(durable.get("nvmPlanId_http").unwrap().as_deref(), Some("XYZ"));
    }

    #[test]
    fn test_oauth_remedies() {
        let (durable, strategy) = oauth_strategy();
        assert_eq!(strategy.remedy(RouterAction::NoCredit), Remedy::Authorize);
        assert_eq!(strategy.remedy(RouterAction::Authorize), Remedy::Authorize);

        durable.set("mcp_access_token", "tok").unwrap();
        assert_eq!(strategy.remedy(RouterAction::OrderPlan), Remedy::Exhausted);
        assert_eq!(strategy.remedy(RouterAction::Authorize), Remedy::Authorize);
        assert!(strategy.can_forward(Some(0)));

        let auth = strategy.request_auth();
        assert_eq!(auth.bearer.as_deref(), Some("tok"));
        assert!(auth.plan_id.is_none());
    }

    #[tokio::test]
    async fn test_refresh_skips_fetch_without_credential() {
        let (durable, strategy) = api_key_strategy();
        let gateway = MockGateway::new();
        gateway.push_credits([Some(7)]);

        assert_eq!(strategy.refresh_credits(&gateway).await, None);
        assert_eq!(gateway.calls().credit_fetches, 0);

        durable.set("nvmApiKey", "ABC").unwrap();
        assert_eq!(strategy.refresh_credits(&gateway).await, Some(7));
    }
}
