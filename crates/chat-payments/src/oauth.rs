//! OAuth 2.1 Authorization Code + PKCE
//!
//! Client for MCP servers that protect their tools with OAuth:
//!
//! 1. Discovery: protected-resource metadata, then the authorization
//!    server's metadata (falling back to OpenID configuration)
//! 2. Dynamic client registration, or a pre-provisioned client id
//! 3. Authorization URL with an S256 challenge and a state nonce
//! 4. Callback verification and code-for-token exchange
//!
//! The state nonce and verifier live in the session store and are reused
//! while a flow is in flight, so preparing the URL twice yields the same
//! request.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::checkout::set_query_pairs;
use crate::credential::{AuthorizationSession, CredentialStore};
use crate::error::{PaymentError, Result};
use crate::http::HttpClient;

const RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";
const AUTH_SERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";

/// Default `client_name` sent on registration
pub const DEFAULT_CLIENT_NAME: &str = "MCP Weather Client";

/// Where the browser should go next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Navigation {
    /// Full navigation (adds a history entry)
    Assign(String),
    /// Rewrite the current location in place
    Replace(String),
}

impl Navigation {
    pub fn target(&self) -> &str {
        match self {
            Navigation::Assign(target) | Navigation::Replace(target) => target,
        }
    }
}

/// OAuth client configuration
#[derive(Clone, Debug)]
pub struct OAuthConfig {
    /// MCP server URL; discovery happens at its origin
    pub mcp_server_url: String,
    /// Registered callback, e.g. `http://localhost:8080/callback`
    pub redirect_uri: String,
    pub client_name: String,
    /// Used when the server offers no registration endpoint
    pub client_id: Option<String>,
}

impl OAuthConfig {
    pub fn new(mcp_server_url: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            mcp_server_url: mcp_server_url.into(),
            redirect_uri: redirect_uri.into(),
            client_name: DEFAULT_CLIENT_NAME.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Scheme, host and port of the MCP server URL, or the URL as given if
    /// it does not parse
    pub fn origin(&self) -> String {
        match Url::parse(&self.mcp_server_url) {
            Ok(url) if url.origin().is_tuple() => url.origin().ascii_serialization(),
            _ => self.mcp_server_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
}

/// Discovered endpoints
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discovery {
    pub authorization_server: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: [&'a str; 1],
    grant_types: [&'a str; 1],
    response_types: [&'a str; 1],
    token_endpoint_auth_method: &'a str,
    code_challenge_method: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

// ── PKCE ────────────────────────────────────────────────────────────────────

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)), no padding
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Fresh verifier (32 random bytes) and state nonce (16 random bytes)
pub fn new_authorization_session(client_id: Option<String>) -> AuthorizationSession {
    AuthorizationSession {
        state: random_token(16),
        code_verifier: random_token(32),
        client_id,
    }
}

// ── Callback ────────────────────────────────────────────────────────────────

/// Parameters an authorization server appends to the redirect URI
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Extract `code` / `state` / `error` and strip them from `url`.
    ///
    /// Returns `None` (leaving `url` untouched) when none is present.
    pub fn take(url: &mut Url) -> Option<Self> {
        let mut params = Self::default();
        let mut rest = Vec::new();

        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                _ => rest.push((key.into_owned(), value.unwrap_or_default())),
            }
        }

        if params == Self::default() {
            return None;
        }

        set_query_pairs(url, &rest);
        Some(params)
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

/// OAuth PKCE client for one MCP server
pub struct OAuthClient {
    config: OAuthConfig,
    http: Arc<dyn HttpClient>,
    credentials: Arc<CredentialStore>,
    discovery: Mutex<Option<Discovery>>,
    client_id: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OAuthClient {
    pub fn new(config: OAuthConfig, http: Arc<dyn HttpClient>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            http,
            credentials,
            discovery: Mutex::new(None),
            client_id: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Discover endpoints (cached after the first success)
    pub async fn discover(&self) -> Result<Discovery> {
        let cached = lock(&self.discovery).clone();
        if let Some(discovery) = cached {
            return Ok(discovery);
        }

        let resource_url = format!("{}{}", self.config.origin(), RESOURCE_METADATA_PATH);
        let response = self.http.get(&resource_url).await?;
        if !response.is_success() {
            return Err(PaymentError::Discovery(format!(
                "resource metadata returned status {}",
                response.status
            )));
        }
        let resource: ResourceMetadata = response.json()?;

        let authorization_server = resource
            .authorization_servers
            .first()
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| PaymentError::Discovery("No authorization server found in resource metadata".into()))?;

        let server = self.fetch_server_metadata(&authorization_server).await?;
        let scopes = resource
            .scopes_supported
            .or(server.scopes_supported)
            .unwrap_or_default();

        let discovery = Discovery {
            authorization_server,
            authorization_endpoint: server.authorization_endpoint,
            token_endpoint: server.token_endpoint,
            registration_endpoint: server.registration_endpoint,
            scopes,
        };
        tracing::debug!(
            authorization_server = %discovery.authorization_server,
            token_endpoint = %discovery.token_endpoint,
            scopes = ?discovery.scopes,
            "Discovered OAuth endpoints"
        );

        *lock(&self.discovery) = Some(discovery.clone());
        Ok(discovery)
    }

    async fn fetch_server_metadata(&self, authorization_server: &str) -> Result<AuthServerMetadata> {
        let primary = format!("{}{}", authorization_server, AUTH_SERVER_METADATA_PATH);
        let response = self.http.get(&primary).await?;
        if response.is_success() {
            return response.json();
        }

        tracing::debug!(status = response.status, "Falling back to OpenID configuration");
        let fallback = format!("{}{}", authorization_server, OPENID_CONFIGURATION_PATH);
        let response = self.http.get(&fallback).await?;
        if !response.is_success() {
            return Err(PaymentError::Discovery(
                "Failed to discover authorization server metadata".into(),
            ));
        }
        response.json()
    }

    /// Client id: in memory, else persisted, else registered (or configured)
    pub async fn register_client(&self) -> Result<String> {
        let cached = lock(&self.client_id).clone();
        if let Some(client_id) = cached {
            return Ok(client_id);
        }
        if let Some(client_id) = self.credentials.client_id()? {
            *lock(&self.client_id) = Some(client_id.clone());
            return Ok(client_id);
        }

        let discovery = self.discover().await?;
        let client_id = match discovery.registration_endpoint.as_deref() {
            Some(endpoint) => {
                let client_id = self.register_dynamically(endpoint).await?;
                self.credentials.store_client_id(&client_id)?;
                client_id
            }
            None => self
                .config
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .ok_or(PaymentError::ClientIdMissing)?,
        };

        *lock(&self.client_id) = Some(client_id.clone());
        Ok(client_id)
    }

    async fn register_dynamically(&self, endpoint: &str) -> Result<String> {
        let request = RegistrationRequest {
            client_name: &self.config.client_name,
            redirect_uris: [&self.config.redirect_uri],
            grant_types: ["authorization_code"],
            response_types: ["code"],
            token_endpoint_auth_method: "none",
            code_challenge_method: "S256",
        };

        let response = self
            .http
            .post_json(endpoint, &serde_json::to_value(&request)?)
            .await?;
        if !response.is_success() {
            return Err(PaymentError::Registration(format!("status {}", response.status)));
        }

        let body: Value = response.json()?;
        let client_id = body
            .get("client_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| PaymentError::Registration("Client registration did not return client_id".into()))?;

        tracing::info!(client_id, "Registered OAuth client");
        Ok(client_id.to_string())
    }

    /// Build the authorization URL without navigating
    pub async fn prepare_authorization_url(&self) -> Result<Url> {
        let client_id = self.register_client().await?;
        let discovery = self.discover().await?;

        let session = match self.credentials.authorization_session()? {
            Some(existing) => {
                tracing::debug!("Reusing in-flight authorization session");
                existing
            }
            None => {
                let fresh = new_authorization_session(Some(client_id.clone()));
                self.credentials.store_authorization_session(&fresh)?;
                fresh
            }
        };

        let mut url = Url::parse(&discovery.authorization_endpoint)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &discovery.scopes.join(" "))
            .append_pair("state", &session.state)
            .append_pair("code_challenge", &code_challenge(&session.code_verifier))
            .append_pair("code_challenge_method", "S256");

        tracing::debug!(endpoint = %discovery.authorization_endpoint, "Prepared authorization URL");
        Ok(url)
    }

    /// Prepare the URL and navigate to it
    pub async fn start_authorization_flow(&self) -> Result<Navigation> {
        let url = self.prepare_authorization_url().await?;
        tracing::info!("Starting authorization flow");
        Ok(Navigation::Assign(url.into()))
    }

    /// Finish the flow from already-stripped callback parameters.
    ///
    /// `Ok(false)` means the URL was not an authorization callback. A state
    /// mismatch fails before the token endpoint is contacted.
    pub async fn complete_authorization_flow(&self, params: &CallbackParams) -> Result<bool> {
        if let Some(error) = params.error.as_deref() {
            tracing::warn!(error, "Authorization server returned an error");
            return Err(PaymentError::AuthorizationDenied(error.to_string()));
        }

        let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
            return Ok(false);
        };

        if self.credentials.stored_state()?.as_deref() != Some(state) {
            tracing::error!("Callback state does not match the stored nonce");
            return Err(PaymentError::StateMismatch);
        }

        let code_verifier = self
            .credentials
            .code_verifier()?
            .ok_or(PaymentError::VerifierMissing)?;

        let discovery = self.discover().await?;
        let client_id = self.callback_client_id()?;

        let form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), self.config.redirect_uri.clone()),
            ("client_id".to_string(), client_id),
            ("code_verifier".to_string(), code_verifier),
        ];
        let response = self.http.post_form(&discovery.token_endpoint, &form).await?;

        if !response.is_success() {
            let reason = serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|body| {
                    body.get("error_description")
                        .or_else(|| body.get("error"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("status {}", response.status));
            return Err(PaymentError::TokenExchange(reason));
        }

        let token: TokenResponse = response.json()?;
        if token.access_token.is_empty() {
            return Err(PaymentError::TokenExchange("empty access token".into()));
        }

        self.credentials.store_access_token(&token.access_token)?;
        self.credentials.clear_authorization_session()?;
        tracing::info!(
            token_type = token.token_type.as_deref().unwrap_or("bearer"),
            scope = token.scope.as_deref().unwrap_or(""),
            "Authorization completed"
        );
        Ok(true)
    }

    fn callback_client_id(&self) -> Result<String> {
        if let Some(client_id) = lock(&self.client_id).clone() {
            return Ok(client_id);
        }
        let client_id = self
            .credentials
            .client_id()?
            .or(self.credentials.authorization_session()?.and_then(|s| s.client_id))
            .or_else(|| self.config.client_id.clone())
            .unwrap_or_default();
        Ok(client_id)
    }

    /// Drop the in-flight state nonce and verifier
    pub fn reset_session(&self) -> Result<()> {
        self.credentials.clear_authorization_session()
    }

    pub fn access_token(&self) -> Result<String> {
        self.credentials.access_token()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Forget the token, the registered client and the plan id
    pub fn clear_tokens(&self) -> Result<()> {
        *lock(&self.client_id) = None;
        self.credentials.clear_oauth()
    }

    pub fn logout(&self) -> Result<Navigation> {
        self.clear_tokens()?;
        Ok(Navigation::Assign("/".into()))
    }
}
