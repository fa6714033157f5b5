//! Application Configuration
//!
//! Everything is read from the environment (after `.env`, which the binary
//! loads). Unset and empty variables fall back to the defaults of the
//! transport's demo agent, with a warning where the default is unlikely to
//! be what a deployment wants.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chat_core::{ChatError, KeyValueStore, Result, Transport};
use chat_payments::{
    ApiKeyStrategy, CheckoutConfig, CredentialStore, CredentialStrategy, HttpClient, OAuthClient,
    OAuthConfig, OAuthStrategy, PollConfig, DEFAULT_CLIENT_NAME,
};

const HTTP_AGENT_ID: &str = "did:nv:f82254a93e8486e102031b6567c2d734f21a71ca793358b1a07d03eb409a546a";
const HTTP_AGENT_ENDPOINT: &str = "http://localhost:3001/ask";
const MCP_AGENT_ID: &str = "did:nv:3fe43029c257aad4694ad037e4ceae5360d7f2061c7982117bf8da9c20614000";
const MCP_AGENT_ENDPOINT: &str = "http://localhost:4002";
const DEFAULT_ENVIRONMENT: &str = "staging_sandbox";

/// Path the checkout and authorization servers send the user back to
pub const CALLBACK_PATH: &str = "/callback";

/// Runtime configuration
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub transport: Transport,
    /// Agent whose plan is purchased at checkout
    pub agent_id: String,
    /// Agent endpoint; the MCP server URL on the MCP transport
    pub agent_endpoint: String,
    /// Payments environment, e.g. `sandbox` or `staging_sandbox`
    pub environment: String,
    /// Pre-provisioned OAuth client id
    pub mcp_client_id: Option<String>,
    /// Base URL of the router / intent / agent API
    pub api_base_url: String,
    /// Public URL of this server
    pub public_url: String,
    /// Overrides the environment-derived checkout host
    pub checkout_base_url: Option<String>,
    pub client_name: String,
    /// Durable state file
    pub storage_path: PathBuf,
    pub poll: PollConfig,
    /// Per-request timeout for backend calls
    pub http_timeout: Duration,
    pub bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Http,
            agent_id: HTTP_AGENT_ID.into(),
            agent_endpoint: HTTP_AGENT_ENDPOINT.into(),
            environment: DEFAULT_ENVIRONMENT.into(),
            mcp_client_id: None,
            api_base_url: "http://localhost:3000".into(),
            public_url: "http://localhost:8080".into(),
            checkout_base_url: None,
            client_name: DEFAULT_CLIENT_NAME.into(),
            storage_path: PathBuf::from(".chat-state.json"),
            poll: PollConfig::default(),
            http_timeout: Duration::from_secs(60),
            bind_addr: "0.0.0.0:8080".into(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(|_| ChatError::Config(format!("{} must be a number of milliseconds, got '{}'", key, raw))),
                None => Ok(default),
            }
        };

        let transport: Transport = match var("CHAT_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => Transport::Http,
        };

        let (id_var, endpoint_var, default_id, default_endpoint) = match transport {
            Transport::Http => ("CHAT_HTTP_AGENT_ID", "CHAT_HTTP_AGENT_ENDPOINT", HTTP_AGENT_ID, HTTP_AGENT_ENDPOINT),
            Transport::Mcp => ("CHAT_MCP_AGENT_ID", "CHAT_MCP_AGENT_ENDPOINT", MCP_AGENT_ID, MCP_AGENT_ENDPOINT),
        };

        let agent_id = var(id_var).or_else(|| var("CHAT_AGENT_ID")).unwrap_or_else(|| {
            tracing::warn!(transport = %transport, "No agent id configured; using the demo agent");
            default_id.into()
        });
        let agent_endpoint = var(endpoint_var).unwrap_or_else(|| {
            tracing::warn!(transport = %transport, endpoint = default_endpoint, "No agent endpoint configured");
            default_endpoint.into()
        });
        let environment = var("CHAT_NVM_ENVIRONMENT").unwrap_or_else(|| {
            tracing::warn!(environment = DEFAULT_ENVIRONMENT, "No payments environment configured");
            DEFAULT_ENVIRONMENT.into()
        });

        let defaults = PollConfig::default();
        let poll = PollConfig {
            init_timeout: millis("CHAT_CREDIT_INIT_TIMEOUT_MS", defaults.init_timeout)?,
            interval: millis("CHAT_CREDIT_POLL_INTERVAL_MS", defaults.interval)?,
            timeout: millis("CHAT_CREDIT_POLL_TIMEOUT_MS", defaults.timeout)?,
        };

        let http_timeout = match var("CHAT_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| ChatError::Config(format!("CHAT_HTTP_TIMEOUT_SECS must be a number, got '{}'", raw)))?,
            None => Duration::from_secs(60),
        };

        let base = Self::default();
        Ok(Self {
            transport,
            agent_id,
            agent_endpoint,
            environment,
            mcp_client_id: var("CHAT_MCP_CLIENT_ID"),
            api_base_url: var("CHAT_API_BASE_URL").unwrap_or(base.api_base_url),
            public_url: var("CHAT_PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(base.public_url),
            checkout_base_url: var("CHAT_CHECKOUT_BASE_URL"),
            client_name: var("CHAT_CLIENT_NAME").unwrap_or(base.client_name),
            storage_path: var("CHAT_STORAGE_PATH").map(PathBuf::from).unwrap_or(base.storage_path),
            poll,
            http_timeout,
            bind_addr: var("BIND_ADDR").unwrap_or(base.bind_addr),
        })
    }

    /// OAuth `redirect_uri` and checkout `returnUrl`
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.public_url, CALLBACK_PATH)
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        let config = CheckoutConfig::new(&self.agent_id, self.redirect_uri()).with_environment(&self.environment);
        match self.checkout_base_url.as_deref() {
            Some(base) => config.with_base_url(base),
            None => config,
        }
    }

    pub fn oauth_config(&self) -> OAuthConfig {
        let config = OAuthConfig::new(&self.agent_endpoint, self.redirect_uri()).with_client_name(&self.client_name);
        match self.mcp_client_id.as_deref() {
            Some(client_id) => config.with_client_id(client_id),
            None => config,
        }
    }

    /// The one credential strategy for this instance, picked from the transport
    pub fn credential_strategy(
        &self,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpClient>,
    ) -> Arc<dyn CredentialStrategy> {
        let credentials = Arc::new(CredentialStore::new(durable, session, self.transport));
        match self.transport {
            Transport::Http => Arc::new(ApiKeyStrategy::new(credentials, self.checkout_config())),
            Transport::Mcp => {
                let client = OAuthClient::new(self.oauth_config(), http, credentials.clone());
                Arc::new(OAuthStrategy::new(credentials, Arc::new(client)))
            }
        }
    }
}
