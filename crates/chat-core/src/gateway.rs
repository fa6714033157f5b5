//! Router/Intent Gateway
//!
//! Contracts for the backend services the conversation depends on: the LLM
//! router, intent synthesis, title summarization, the credit ledger and the
//! agent itself. Implementations live elsewhere; the state machine works
//! exclusively through [`Gateway`].

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ChatError, Result};
use crate::message::HistoryEntry;
use crate::tool::{ToolCall, ToolCatalog};

/// Agent transport, chosen once per application instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// API key + credit checkout
    Http,
    /// OAuth 2.1 + PKCE against an MCP server
    Mcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Mcp => "mcp",
        }
    }

    /// Whether the agent exposes a tool catalog worth prefetching
    pub fn supports_tools(&self) -> bool {
        matches!(self, Transport::Mcp)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Transport {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "mcp" => Ok(Transport::Mcp),
            other => Err(ChatError::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// Credential material attached to every gateway request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestAuth {
    pub transport: Transport,
    /// API key or OAuth access token
    pub bearer: Option<String>,
    /// Only sent with the API-key credential
    pub plan_id: Option<String>,
}

impl RequestAuth {
    pub fn anonymous(transport: Transport) -> Self {
        Self {
            transport,
            bearer: None,
            plan_id: None,
        }
    }

    /// Header pairs for the request
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(3);
        if let Some(bearer) = self.bearer.as_deref().filter(|b| !b.is_empty()) {
            headers.push(("Authorization", format!("Bearer {}", bearer)));
        }
        if let Some(plan_id) = self.plan_id.as_deref().filter(|p| !p.is_empty()) {
            headers.push(("X-Plan-Id", plan_id.to_string()));
        }
        headers.push(("X-Agent-Mode", self.transport.to_string()));
        headers
    }
}

/// Router verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterAction {
    Forward,
    NoCredit,
    OrderPlan,
    NoAction,
    Authorize,
}

/// Router response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub action: RouterAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RouterDecision {
    pub fn new(action: RouterAction) -> Self {
        Self {
            action,
            message: None,
            reason: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// `message`, else `reason`, trimmed; `None` when both are blank
    pub fn explanation(&self) -> Option<&str> {
        [self.message.as_deref(), self.reason.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Router request body
#[derive(Clone, Debug, Serialize)]
pub struct RouterRequest<'a> {
    pub message: &'a str,
    pub history: &'a [HistoryEntry],
}

/// Intent synthesis request body
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRequest<'a> {
    pub history: &'a [HistoryEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_catalog: Option<&'a ToolCatalog>,
}

/// Title summarization request body
#[derive(Clone, Debug, Serialize)]
pub struct TitleRequest<'a> {
    pub history: &'a [HistoryEntry],
}

/// What the agent should be asked
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    /// Free-text prompt for the agent
    Prompt(String),
    /// Structured tool call, schema-validated by the synthesizer
    ToolCall(ToolCall),
}

impl Intent {
    /// Interpret an intent-synthesis reply.
    ///
    /// Accepts `{intent: "..."}`, `{intent: {tool, args}}`, a bare
    /// `{tool, args}` object, or a bare string. Anything else, including an
    /// empty prompt, is an error. There is deliberately no fallback to the
    /// raw user text.
    pub fn from_reply(reply: Value) -> Result<Self> {
        let candidate = match reply {
            Value::Object(mut map) => match map.remove("intent") {
                Some(inner) => inner,
                None => Value::Object(map),
            },
            other => other,
        };

        match candidate {
            Value::String(prompt) if !prompt.trim().is_empty() => Ok(Intent::Prompt(prompt)),
            Value::Object(ref map) if map.get("tool").is_some_and(Value::is_string) => {
                Ok(Intent::ToolCall(serde_json::from_value(candidate)?))
            }
            other => Err(ChatError::IntentUnavailable(format!(
                "unrecognized intent shape: {}",
                other
            ))),
        }
    }
}

/// Agent response, normalized across the prompt and tool-call paths
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub response: String,
    /// Settlement hash, when credits were redeemed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Credits redeemed for this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<i64>,
    /// Raw tool content (tool-call path only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl AgentReply {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            ..Default::default()
        }
    }

    /// Parse a `/api/agent` body: `{output, redemptionResult?: {txHash, creditsRedeemed}}`
    pub fn from_agent_body(body: &Value) -> Self {
        let redemption = body.get("redemptionResult");
        Self {
            response: body
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tx_hash: redemption
                .and_then(|r| r.get("txHash"))
                .and_then(Value::as_str)
                .map(str::to_string),
            credits: redemption
                .and_then(|r| r.get("creditsRedeemed"))
                .and_then(integer_like),
            content: None,
        }
    }

    /// Parse a `/api/mcp/tool` body: `{output, content?}`
    pub fn from_tool_body(body: &Value) -> Self {
        Self {
            response: body
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: body.get("content").cloned(),
            ..Default::default()
        }
    }

    /// Both halves of the settlement metadata, if present
    pub fn settlement(&self) -> Option<(&str, i64)> {
        match (self.tx_hash.as_deref(), self.credits) {
            (Some(hash), Some(credits)) if !hash.is_empty() => Some((hash, credits)),
            _ => None,
        }
    }
}

/// Price of the active plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCost {
    /// Decimal amount in USDC, kept as text to avoid float rounding
    #[serde(deserialize_with = "string_or_number")]
    pub plan_price: String,
    #[serde(deserialize_with = "integer_from_any")]
    pub plan_credits: i64,
}

/// `{credit: number}`; anything else is "unknown"
pub fn credit_from_body(body: &Value) -> Option<i64> {
    body.get("credit").and_then(integer_like)
}

fn integer_like(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected price, got {}", other))),
    }
}

fn integer_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    integer_like(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {}", value)))
}

/// Strategy trait for the backend services
///
/// The conversation state machine works exclusively through this interface.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Ask the router what to do with `message`
    async fn route(
        &self,
        auth: &RequestAuth,
        message: &str,
        history: &[HistoryEntry],
    ) -> Result<RouterDecision>;

    /// Turn the history into an agent prompt or tool call
    async fn synthesize_intent(
        &self,
        auth: &RequestAuth,
        history: &[HistoryEntry],
        catalog: Option<&ToolCatalog>,
    ) -> Result<Intent>;

    /// Short title for a new conversation
    async fn summarize_title(&self, auth: &RequestAuth, history: &[HistoryEntry]) -> Result<String>;

    /// Current credit balance; `None` means unknown
    async fn fetch_credits(&self, auth: &RequestAuth) -> Result<Option<i64>>;

    async fn plan_cost(&self, auth: &RequestAuth) -> Result<PlanCost>;

    async fn call_agent(&self, auth: &RequestAuth, prompt: &str) -> Result<AgentReply>;

    /// Tool catalog (MCP transport)
    async fn list_tools(&self, auth: &RequestAuth) -> Result<ToolCatalog>;

    async fn call_tool(&self, auth: &RequestAuth, call: &ToolCall) -> Result<AgentReply>;
}
