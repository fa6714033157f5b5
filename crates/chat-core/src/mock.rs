//! Mock Gateway
//!
//! Scripted [`Gateway`] for tests and offline demos. Responses are queued
//! per endpoint and every call is recorded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{ChatError, Result};
use crate::gateway::{AgentReply, Gateway, Intent, PlanCost, RequestAuth, RouterDecision};
use crate::message::{HistoryEntry, Role};
use crate::tool::{ToolCall, ToolCatalog};

/// Everything the mock has been asked
#[derive(Clone, Debug, Default)]
pub struct MockCalls {
    /// Messages passed to the router
    pub routed: Vec<String>,
    /// Histories passed to intent synthesis
    pub intents: Vec<Vec<HistoryEntry>>,
    pub titles: usize,
    pub credit_fetches: usize,
    pub plan_costs: usize,
    /// Prompts sent to the agent
    pub agent_prompts: Vec<String>,
    pub tool_listings: usize,
    pub tool_calls: Vec<ToolCall>,
    /// Credentials seen on each call, in order
    pub auths: Vec<RequestAuth>,
}

impl MockCalls {
    /// Prompt and tool-call invocations combined
    pub fn agent_calls(&self) -> usize {
        self.agent_prompts.len() + self.tool_calls.len()
    }
}

#[derive(Default)]
struct Script {
    decisions: VecDeque<Result<RouterDecision>>,
    intents: VecDeque<Result<Intent>>,
    titles: VecDeque<Result<String>>,
    credits: VecDeque<Option<i64>>,
    last_credits: Option<i64>,
    plan_cost: Option<PlanCost>,
    replies: VecDeque<Result<AgentReply>>,
    catalog: Option<ToolCatalog>,
    calls: MockCalls,
}

/// Mock gateway with scripted responses
///
/// With nothing scripted, the router forwards, intent synthesis echoes the
/// last user turn, and the agent answers "ok".
#[derive(Default)]
pub struct MockGateway {
    script: Mutex<Script>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a router decision
    pub fn push_decision(&self, decision: RouterDecision) -> &Self {
        self.script().decisions.push_back(Ok(decision));
        self
    }

    /// Queue a router transport failure
    pub fn push_route_error(&self) -> &Self {
        self.script()
            .decisions
            .push_back(Err(ChatError::network("/api/llm-router", "connection refused")));
        self
    }

    pub fn push_intent(&self, intent: Intent) -> &Self {
        self.script().intents.push_back(Ok(intent));
        self
    }

    pub fn push_intent_error(&self) -> &Self {
        self.script()
            .intents
            .push_back(Err(ChatError::IntentUnavailable("scripted failure".into())));
        self
    }

    pub fn push_title(&self, title: impl Into<String>) -> &Self {
        self.script().titles.push_back(Ok(title.into()));
        self
    }

    /// Queue credit balances; the last one keeps being returned
    pub fn push_credits(&self, balances: impl IntoIterator<Item = Option<i64>>) -> &Self {
        self.script().credits.extend(balances);
        self
    }

    pub fn set_plan_cost(&self, price: impl Into<String>, credits: i64) -> &Self {
        self.script().plan_cost = Some(PlanCost {
            plan_price: price.into(),
            plan_credits: credits,
        });
        self
    }

    pub fn push_reply(&self, reply: AgentReply) -> &Self {
        self.script().replies.push_back(Ok(reply));
        self
    }

    pub fn push_agent_error(&self) -> &Self {
        self.script()
            .replies
            .push_back(Err(ChatError::network("/api/agent", "connection reset")));
        self
    }

    pub fn set_catalog(&self, catalog: ToolCatalog) -> &Self {
        self.script().catalog = Some(catalog);
        self
    }

    /// Snapshot of the recorded calls
    pub fn calls(&self) -> MockCalls {
        self.script().calls.clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn route(
        &self,
        auth: &RequestAuth,
        message: &str,
        _history: &[HistoryEntry],
    ) -> Result<RouterDecision> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.routed.push(message.to_string());
        script
            .decisions
            .pop_front()
            .unwrap_or_else(|| Ok(RouterDecision::new(crate::gateway::RouterAction::Forward)))
    }

    async fn synthesize_intent(
        &self,
        auth: &RequestAuth,
        history: &[HistoryEntry],
        _catalog: Option<&ToolCatalog>,
    ) -> Result<Intent> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.intents.push(history.to_vec());
        script.intents.pop_front().unwrap_or_else(|| {
            history
                .iter()
                .rev()
                .find(|h| h.role == Role::User)
                .map(|h| Intent::Prompt(h.content.clone()))
                .ok_or_else(|| ChatError::IntentUnavailable("no user turn".into()))
        })
    }

    async fn summarize_title(&self, auth: &RequestAuth, _history: &[HistoryEntry]) -> Result<String> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.titles += 1;
        script.titles.pop_front().unwrap_or_else(|| {
            Err(ChatError::Status {
                endpoint: "/api/title/summarize".into(),
                status: 503,
            })
        })
    }

    async fn fetch_credits(&self, auth: &RequestAuth) -> Result<Option<i64>> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.credit_fetches += 1;
        if let Some(next) = script.credits.pop_front() {
            script.last_credits = next;
        }
        Ok(script.last_credits)
    }

    async fn plan_cost(&self, auth: &RequestAuth) -> Result<PlanCost> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.plan_costs += 1;
        script.plan_cost.clone().ok_or_else(|| ChatError::Status {
            endpoint: "/api/plan/cost".into(),
            status: 404,
        })
    }

    async fn call_agent(&self, auth: &RequestAuth, prompt: &str) -> Result<AgentReply> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.agent_prompts.push(prompt.to_string());
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Ok(AgentReply::text("ok")))
    }

    async fn list_tools(&self, auth: &RequestAuth) -> Result<ToolCatalog> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.tool_listings += 1;
        script
            .catalog
            .clone()
            .ok_or_else(|| ChatError::network("/api/mcp/tools", "no catalog"))
    }

    async fn call_tool(&self, auth: &RequestAuth, call: &ToolCall) -> Result<AgentReply> {
        let mut script = self.script();
        script.calls.auths.push(auth.clone());
        script.calls.tool_calls.push(call.clone());
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| Ok(AgentReply::text("ok")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{RouterAction, Transport};

    #[tokio::test]
    async fn test_scripted_decisions() {
        let gateway = MockGateway::new();
        gateway
            .push_decision(RouterDecision::new(RouterAction::NoCredit))
            .push_route_error();
        let auth = RequestAuth::anonymous(Transport::Http);

        let first = gateway.route(&auth, "hi", &[]).await.unwrap();
        assert_eq!(first.action, RouterAction::NoCredit);
        assert!(gateway.route(&auth, "hi", &[]).await.is_err());
        assert_eq!(gateway.route(&auth, "hi", &[]).await.unwrap().action, RouterAction::Forward);
        assert_eq!(gateway.calls().routed.len(), 3);
    }

    #[tokio::test]
    async fn test_credit_sequence_sticks_on_last() {
        let gateway = MockGateway::new();
        gateway.push_credits([None, Some(5)]);
        let auth = RequestAuth::anonymous(Transport::Http);

        assert_eq!(gateway.fetch_credits(&auth).await.unwrap(), None);
        assert_eq!(gateway.fetch_credits(&auth).await.unwrap(), Some(5));
        assert_eq!(gateway.fetch_credits(&auth).await.unwrap(), Some(5));
        assert_eq!(gateway.calls().credit_fetches, 3);
    }

    #[tokio::test]
    async fn test_default_intent_echoes_user() {
        let gateway = MockGateway::new();
        let auth = RequestAuth::anonymous(Transport::Http);
        let intent = gateway
            .synthesize_intent(&auth, &[HistoryEntry::user("weather in Rome")], None)
            .await
            .unwrap();
        assert_eq!(intent, Intent::Prompt("weather in Rome".into()));
    }
}
