//! # chat-payments
//!
//! Credential acquisition for the paywalled agent chat.
//!
//! ## Credential Strategies
//!
//! Two mutually exclusive strategies, picked once from the transport:
//!
//! ### 1. API key + credit checkout (HTTP transport)
//!
//! **Flow:** Chat notice → hosted plan checkout → back with an API key
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │  Chat       │────▶│  Plan checkout  │────▶│  ?nvm-api-key&planId │
//! │  (notice)   │     │  (hosted)       │     │  poll for credits    │
//! └─────────────┘     └─────────────────┘     └──────────────────────┘
//! ```
//!
//! ### 2. OAuth 2.1 + PKCE (MCP transport)
//!
//! **Flow:** Chat `authorize` message → authorization server → callback
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │  Chat       │────▶│  Authorization  │────▶│  ?code&state         │
//! │ (authorize) │     │  server         │     │  token exchange      │
//! └─────────────┘     └─────────────────┘     └──────────────────────┘
//! ```
//!
//! Either way the message that triggered the redirect is parked in the
//! [`PendingActionStore`] first and replayed once on return.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_payments::{CheckoutConfig, CheckoutReturn};
//!
//! let checkout = CheckoutConfig::new(agent_id, "http://localhost:8080/callback")
//!     .with_environment("sandbox");
//! let url = checkout.checkout_url(true)?;
//!
//! // ...user returns to /callback?nvm-api-key=…&planId=…
//! let returned = CheckoutReturn::take(&mut current_url);
//! ```

mod checkout;
mod credential;
mod error;
mod http;
mod oauth;
mod pending;
mod reconcile;
mod strategy;

pub use checkout::{
    cost_message, set_query_pairs, usd_cost, CheckoutConfig, CheckoutReturn, API_KEY_PARAM,
    DEFAULT_CHECKOUT_BASE, PLAN_ID_PARAM, SANDBOX_CHECKOUT_BASE,
};
pub use credential::{api_key_ttl, AuthorizationSession, Credential, CredentialStore};
pub use error::{PaymentError, Result};
pub use http::{transport_error, HttpClient, HttpResponse, Method, MockHttpClient, RecordedRequest};
pub use oauth::{
    code_challenge, new_authorization_session, CallbackParams, Discovery, Navigation, OAuthClient,
    OAuthConfig, DEFAULT_CLIENT_NAME,
};
pub use pending::{Parked, PendingAction, PendingActionStore};
pub use reconcile::{CreditPoller, CreditSource, GatewayCredits, PollConfig};
pub use strategy::{ApiKeyStrategy, CredentialStrategy, OAuthStrategy, Remedy};
