//! HTTP Gateway
//!
//! [`Gateway`] implementation against the router / intent / agent API. Every
//! request carries the credential headers from [`RequestAuth::headers`].

use std::time::Duration;

use async_trait::async_trait;
use chat_core::gateway::{IntentRequest, RouterRequest, TitleRequest, credit_from_body};
use chat_core::{
    AgentReply, ChatError, Gateway, HistoryEntry, Intent, PlanCost, RequestAuth, Result, RouterDecision,
    ToolCall, ToolCatalog,
};
use serde::Serialize;
use serde_json::{Value, json};

const ROUTER_PATH: &str = "/api/llm-router";
const INTENT_PATH: &str = "/api/intent/synthesize";
const TITLE_PATH: &str = "/api/title/summarize";
const CREDIT_PATH: &str = "/api/credit";
const PLAN_COST_PATH: &str = "/api/plan/cost";
const AGENT_PATH: &str = "/api/agent";
const TOOLS_PATH: &str = "/api/mcp/tools";
const TOOL_PATH: &str = "/api/mcp/tool";

/// Live gateway over reqwest
#[derive(Clone, Debug)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder, auth: &RequestAuth) -> reqwest::RequestBuilder {
        auth.headers()
            .into_iter()
            .fold(request, |request, (name, value)| request.header(name, value))
    }

    async fn send(&self, path: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| ChatError::network(path, e))?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(path, status = status.as_u16(), "Gateway call rejected");
            return Err(ChatError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| ChatError::network(path, e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ChatError::InvalidResponse {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn get(&self, path: &str, auth: &RequestAuth) -> Result<Value> {
        let request = self.authorized(self.client.get(self.url(path)), auth);
        self.send(path, request).await
    }

    async fn post<B: Serialize + ?Sized + Sync>(&self, path: &str, auth: &RequestAuth, body: &B) -> Result<Value> {
        let request = self.authorized(self.client.post(self.url(path)).json(body), auth);
        self.send(path, request).await
    }
}

fn invalid(endpoint: &str, message: impl Into<String>) -> ChatError {
    ChatError::InvalidResponse {
        endpoint: endpoint.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn route(&self, auth: &RequestAuth, message: &str, history: &[HistoryEntry]) -> Result<RouterDecision> {
        let body = self.post(ROUTER_PATH, auth, &RouterRequest { message, history }).await?;
        serde_json::from_value(body).map_err(|e| invalid(ROUTER_PATH, e.to_string()))
    }

    async fn synthesize_intent(
        &self,
        auth: &RequestAuth,
        history: &[HistoryEntry],
        catalog: Option<&ToolCatalog>,
    ) -> Result<Intent> {
        let request = IntentRequest {
            history,
            tools_catalog: catalog,
        };
        let body = self.post(INTENT_PATH, auth, &request).await?;
        Intent::from_reply(body)
    }

    async fn summarize_title(&self, auth: &RequestAuth, history: &[HistoryEntry]) -> Result<String> {
        let body = self.post(TITLE_PATH, auth, &TitleRequest { history }).await?;
        body.get("title")
            .and_then(Value::as_str)
            .filter(|title| !title.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| invalid(TITLE_PATH, "missing title"))
    }

    async fn fetch_credits(&self, auth: &RequestAuth) -> Result<Option<i64>> {
        let body = self.get(CREDIT_PATH, auth).await?;
        Ok(credit_from_body(&body))
    }

    async fn plan_cost(&self, auth: &RequestAuth) -> Result<PlanCost> {
        let body = self.get(PLAN_COST_PATH, auth).await?;
        serde_json::from_value(body).map_err(|e| invalid(PLAN_COST_PATH, e.to_string()))
    }

    async fn call_agent(&self, auth: &RequestAuth, prompt: &str) -> Result<AgentReply> {
        let body = self.post(AGENT_PATH, auth, &json!({ "input_query": prompt })).await?;
        Ok(AgentReply::from_agent_body(&body))
    }

    async fn list_tools(&self, auth: &RequestAuth) -> Result<ToolCatalog> {
        let body = self.get(TOOLS_PATH, auth).await?;
        ToolCatalog::from_body(body)
    }

    async fn call_tool(&self, auth: &RequestAuth, call: &ToolCall) -> Result<AgentReply> {
        let body = self.post(TOOL_PATH, auth, call).await?;
        Ok(AgentReply::from_tool_body(&body))
    }
}
