//! Credential Store
//!
//! Persists the active credential and the in-flight OAuth session material.
//! Exactly one credential kind is used per instance, fixed by the transport.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chat_core::{keys, KeyValueStore, RequestAuth, StorageKeys, Transport};
use chrono::Duration;

use crate::error::{PaymentError, Result};

/// How long an API key obtained from checkout survives a reload
pub fn api_key_ttl() -> Duration {
    Duration::hours(24)
}

/// Active credential
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// API key + plan from the checkout flow (TTL'd)
    ApiKey { api_key: String, plan_id: Option<String> },
    /// OAuth access token (untimed)
    OAuth { access_token: String },
}

impl Credential {
    /// Value for the `Authorization: Bearer` header
    pub fn bearer(&self) -> &str {
        match self {
            Credential::ApiKey { api_key, .. } => api_key,
            Credential::OAuth { access_token } => access_token,
        }
    }

    pub fn plan_id(&self) -> Option<&str> {
        match self {
            Credential::ApiKey { plan_id, .. } => plan_id.as_deref(),
            Credential::OAuth { .. } => None,
        }
    }
}

// Keep secrets out of logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey { plan_id, .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"<redacted>")
                .field("plan_id", plan_id)
                .finish(),
            Credential::OAuth { .. } => f
                .debug_struct("OAuth")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// Session-scoped OAuth material, reused until consumed or cleared
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationSession {
    pub state: String,
    pub code_verifier: String,
    pub client_id: Option<String>,
}

impl std::fmt::Debug for AuthorizationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationSession")
            .field("state", &self.state)
            .field("code_verifier", &"<redacted>")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Reads and writes credentials in the durable and session stores
pub struct CredentialStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    transport: Transport,
    keys: StorageKeys,
    /// Access token cached after the first read
    token: Mutex<Option<String>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl CredentialStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        transport: Transport,
    ) -> Self {
        Self {
            durable,
            session,
            transport,
            keys: StorageKeys::new(transport),
            token: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn cached_token(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- API key -----

    pub fn api_key(&self) -> Result<Option<String>> {
        Ok(non_empty(self.durable.get(keys::API_KEY)?))
    }

    pub fn plan_id(&self) -> Result<Option<String>> {
        Ok(non_empty(self.durable.get(&self.keys.plan_id())?))
    }

    /// Persist a checkout-issued API key (24h) and, when given, its plan
    pub fn store_api_key(&self, api_key: &str, plan_id: Option<&str>) -> Result<()> {
        self.durable.set_with_ttl(keys::API_KEY, api_key, api_key_ttl())?;
        if let Some(plan_id) = plan_id {
            self.store_plan_id(plan_id)?;
        }
        tracing::info!(plan_stored = plan_id.is_some(), "Stored API key from checkout");
        Ok(())
    }

    pub fn store_plan_id(&self, plan_id: &str) -> Result<()> {
        self.durable.set(&self.keys.plan_id(), plan_id)?;
        Ok(())
    }

    /// Forget the API key and this transport's plan id
    pub fn clear_api_key(&self) -> Result<()> {
        self.durable.remove(keys::API_KEY)?;
        self.durable.remove(&self.keys.plan_id())?;
        tracing::info!(transport = %self.transport, "Cleared API key");
        Ok(())
    }

    // ----- OAuth token -----

    /// In-memory token, else the persisted one
    pub fn access_token(&self) -> Result<String> {
        let mut cached = self.cached_token();
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let stored = non_empty(self.durable.get(keys::ACCESS_TOKEN)?)
            .ok_or(PaymentError::AuthorizationRequired)?;
        *cached = Some(stored.clone());
        Ok(stored)
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_ok()
    }

    pub fn store_access_token(&self, token: &str) -> Result<()> {
        self.durable.set(keys::ACCESS_TOKEN, token)?;
        *self.cached_token() = Some(token.to_string());
        Ok(())
    }

    /// Registered client id from a previous dynamic registration
    pub fn client_id(&self) -> Result<Option<String>> {
        Ok(non_empty(self.durable.get(keys::CLIENT_ID)?))
    }

    pub fn store_client_id(&self, client_id: &str) -> Result<()> {
        self.durable.set(keys::CLIENT_ID, client_id)?;
        Ok(())
    }

    // ----- Authorization session -----

    /// Both the state nonce and the verifier, if a flow is in flight
    pub fn authorization_session(&self) -> Result<Option<AuthorizationSession>> {
        let state = non_empty(self.session.get(keys::OAUTH_STATE)?);
        let verifier = non_empty(self.session.get(keys::OAUTH_CODE_VERIFIER)?);
        let client_id = non_empty(self.session.get(keys::OAUTH_CLIENT_ID)?);
        Ok(match (state, verifier) {
            (Some(state), Some(code_verifier)) => Some(AuthorizationSession {
                state,
                code_verifier,
                client_id,
            }),
            _ => None,
        })
    }

    pub fn stored_state(&self) -> Result<Option<String>> {
        Ok(non_empty(self.session.get(keys::OAUTH_STATE)?))
    }

    pub fn code_verifier(&self) -> Result<Option<String>> {
        Ok(non_empty(self.session.get(keys::OAUTH_CODE_VERIFIER)?))
    }

    pub fn store_authorization_session(&self, session: &AuthorizationSession) -> Result<()> {
        self.session.set(keys::OAUTH_STATE, &session.state)?;
        self.session.set(keys::OAUTH_CODE_VERIFIER, &session.code_verifier)?;
        match session.client_id.as_deref() {
            Some(client_id) => self.session.set(keys::OAUTH_CLIENT_ID, client_id)?,
            None => self.session.remove(keys::OAUTH_CLIENT_ID)?,
        }
        Ok(())
    }

    pub fn clear_authorization_session(&self) -> Result<()> {
        self.session.remove(keys::OAUTH_STATE)?;
        self.session.remove(keys::OAUTH_CODE_VERIFIER)?;
        self.session.remove(keys::OAUTH_CLIENT_ID)?;
        Ok(())
    }

    /// Logout: token, registered client id and this transport's plan id
    pub fn clear_oauth(&self) -> Result<()> {
        *self.cached_token() = None;
        self.durable.remove(keys::ACCESS_TOKEN)?;
        self.durable.remove(keys::CLIENT_ID)?;
        self.durable.remove(&self.keys.plan_id())?;
        tracing::info!(transport = %self.transport, "Cleared OAuth credentials");
        Ok(())
    }

    /// The credential matching the configured transport, if held
    pub fn current(&self) -> Result<Option<Credential>> {
        match self.transport {
            Transport::Http => Ok(self.api_key()?.map(|api_key| Credential::ApiKey {
                api_key,
                plan_id: self.plan_id().ok().flatten(),
            })),
            Transport::Mcp => match self.access_token() {
                Ok(access_token) => Ok(Some(Credential::OAuth { access_token })),
                Err(PaymentError::AuthorizationRequired) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Header material for gateway calls, from [`Self::current`]
    pub fn request_auth(&self) -> RequestAuth {
        let credential = self.current().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read credential");
            None
        });
        RequestAuth {
            transport: self.transport,
            bearer: credential.as_ref().map(|c| c.bearer().to_string()),
            plan_id: credential.as_ref().and_then(Credential::plan_id).map(str::to_string),
        }
    }
}
