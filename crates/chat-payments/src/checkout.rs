//! Credit Checkout
//!
//! Builds the hosted checkout URL for the agent's plan, parses the
//! parameters checkout appends to the return URL, and prices redeemed
//! credits.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌────────────────────────────┐
//! │  Chat       │────▶│  Hosted plan    │────▶│  returnUrl?nvm-api-key=…   │
//! │  (notice)   │     │  checkout       │     │            &planId=…       │
//! └─────────────┘     └─────────────────┘     └────────────────────────────┘
//! ```

use chat_core::PlanCost;
use rust_decimal::Decimal;
use url::Url;

use crate::error::{PaymentError, Result};

/// Checkout host for the `sandbox` environment
pub const SANDBOX_CHECKOUT_BASE: &str = "https://nevermined.app";
/// Checkout host for every other environment
pub const DEFAULT_CHECKOUT_BASE: &str = "https://nevermined.dev";

/// Query parameter carrying the issued API key
pub const API_KEY_PARAM: &str = "nvm-api-key";
/// Query parameter carrying the purchased plan
pub const PLAN_ID_PARAM: &str = "planId";

/// Where and for whom checkout happens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutConfig {
    pub agent_id: String,
    pub environment: Option<String>,
    /// Overrides the environment-derived host
    pub base_url: Option<String>,
    /// Where checkout sends the user back
    pub return_url: String,
}

impl CheckoutConfig {
    pub fn new(agent_id: impl Into<String>, return_url: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            environment: None,
            base_url: None,
            return_url: return_url.into(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Checkout host
    pub fn base(&self) -> &str {
        if let Some(base) = self.base_url.as_deref().filter(|b| !b.is_empty()) {
            return base;
        }
        match self.environment.as_deref() {
            Some("sandbox") => SANDBOX_CHECKOUT_BASE,
            _ => DEFAULT_CHECKOUT_BASE,
        }
    }

    /// `{base}/checkout/{agentId}?export=nvm-api-key&returnUrl=…`
    ///
    /// `export` asks checkout to hand back an API key, so it is only sent
    /// while none is held.
    pub fn checkout_url(&self, request_api_key: bool) -> Result<Url> {
        if self.agent_id.trim().is_empty() {
            return Err(PaymentError::Checkout("agent id is not configured".into()));
        }

        let mut url = Url::parse(self.base())?;
        url.path_segments_mut()
            .map_err(|()| PaymentError::Checkout(format!("'{}' cannot be a base URL", self.base())))?
            .pop_if_empty()
            .push("checkout")
            .push(&self.agent_id);

        {
            let mut query = url.query_pairs_mut();
            if request_api_key {
                query.append_pair("export", API_KEY_PARAM);
            }
            if !self.return_url.is_empty() {
                query.append_pair("returnUrl", &self.return_url);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url)
    }
}

/// Parameters checkout appends to the return URL
#[derive(Clone, PartialEq, Eq)]
pub struct CheckoutReturn {
    pub api_key: Option<String>,
    pub plan_id: Option<String>,
}

impl std::fmt::Debug for CheckoutReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutReturn")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("plan_id", &self.plan_id)
            .finish()
    }
}

impl CheckoutReturn {
    /// Extract `nvm-api-key` / `planId` and strip them from `url`.
    ///
    /// Returns `None` (leaving `url` untouched) when neither is present.
    pub fn take(url: &mut Url) -> Option<Self> {
        let mut api_key = None;
        let mut plan_id = None;
        let mut rest = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                API_KEY_PARAM if !value.is_empty() => api_key = Some(value.into_owned()),
                PLAN_ID_PARAM if !value.is_empty() => plan_id = Some(value.into_owned()),
                API_KEY_PARAM | PLAN_ID_PARAM => {}
                _ => rest.push((key.into_owned(), value.into_owned())),
            }
        }

        if api_key.is_none() && plan_id.is_none() {
            return None;
        }

        set_query_pairs(url, &rest);
        Some(Self { api_key, plan_id })
    }
}

/// Replace the query of `url` with `pairs`, dropping `?` when empty
pub fn set_query_pairs(url: &mut Url, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
}

/// `planPrice / planCredits × creditsUsed`, zero when the plan has no credits
pub fn usd_cost(cost: &PlanCost, credits_used: i64) -> Result<Decimal> {
    let price: Decimal = cost
        .plan_price
        .trim()
        .parse()
        .map_err(|e| PaymentError::Checkout(format!("invalid plan price '{}': {}", cost.plan_price, e)))?;

    if cost.plan_credits <= 0 {
        return Ok(Decimal::ZERO);
    }

    Ok(price / Decimal::from(cost.plan_credits) * Decimal::from(credits_used))
}

/// User-facing cost line
pub fn cost_message(amount: Decimal) -> String {
    format!("The final cost has been {:.4} USDC.", amount)
}
