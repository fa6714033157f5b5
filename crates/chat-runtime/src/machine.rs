//! Conversation State Machine
//!
//! Drives one user turn from the router decision to the agent answer, and
//! the redirect round trips in between:
//!
//! ```text
//! Idle → RouterDecisionPending → Forward ─────────→ IntentSynthesisPending → AgentCallPending → Idle
//!                              ├→ NeedsCheckout ──────→ (redirect, park action)
//!                              ├→ NeedsAuthorization ─→ (redirect, park action)
//!                              └→ AnsweredDirectly ───→ Idle
//! ```
//!
//! A parked action is replayed through [`ConversationMachine::resume`] once
//! the user is back on the callback URL. The replay runs with the resume
//! latch set: the original user turn is not appended again and the local
//! credential re-check is skipped.

use std::sync::Arc;

use chat_core::{
    ChatHistory, ChatMessage, Conversation, Gateway, HistoryEntry, Intent, KeyValueStore, RequestAuth,
    RouterAction, RouterDecision, ToolCatalog, Transport, fallback_title, keys,
};
use chat_payments::{
    CallbackParams, CheckoutReturn, CreditPoller, CredentialStrategy, GatewayCredits, Navigation, Parked,
    PaymentError, PendingAction, PendingActionStore, PollConfig, Remedy, Result, cost_message, usd_cost,
};
use url::Url;

use crate::resume::{ResumePlan, ReturnSignal, plan_resume};

const ROUTER_FALLBACK: &str = "I can chat without using the agent. Ask me anything or try again.";
const CHECKOUT_FAILED: &str = "Unable to redirect to checkout. Please try again.";
const INTENT_FAILED: &str = "Unable to synthesize intent. Please try again.";
const AGENT_FAILED: &str = "Error communicating with the agent. Please try again.";
const AUTHORIZE_PROMPT: &str = "Please connect your account to use the agent.";
const CREDITS_EXHAUSTED: &str = "You have no credits left on your plan. Purchase more credits to continue.";
const PURCHASE_NOT_COMPLETED: &str =
    "Purchase not completed. Your message was not sent; send it again once your plan is active.";

/// Where the machine is within a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RouterDecisionPending,
    Forward,
    NeedsCheckout,
    NeedsAuthorization,
    AnsweredDirectly,
    IntentSynthesisPending,
    AgentCallPending,
    Error,
}

/// How a turn ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The agent answered
    Answered,
    /// The router answered without the agent
    AnsweredDirectly,
    /// Halted on a checkout notice carrying this URL
    NeedsCheckout(String),
    /// Halted on an `authorize` message carrying this URL
    NeedsAuthorization(String),
    /// Authenticated, but the plan has no credits left
    Exhausted,
    /// An error message was appended
    Failed,
}

/// What a return visit did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resumed {
    pub signal: ReturnSignal,
    pub plan: ResumePlan,
    /// Outcome of the replayed message, if one was sent
    pub replay: Option<SendOutcome>,
}

/// Why a turn did not reach the agent
enum Blocked<'a> {
    Router(&'a RouterDecision),
    /// `forward`, but the local credential check failed
    LocalCheck,
}

/// The conversation orchestrator for one transport
pub struct ConversationMachine {
    gateway: Arc<dyn Gateway>,
    strategy: Arc<dyn CredentialStrategy>,
    history: ChatHistory,
    pending: PendingActionStore,
    poller: CreditPoller,
    phase: Phase,
    credits: Option<i64>,
    /// Set while a parked action is being replayed
    resuming: bool,
}

impl ConversationMachine {
    pub fn builder() -> ConversationMachineBuilder {
        ConversationMachineBuilder::new()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last known balance; `None` while unknown
    pub fn credits(&self) -> Option<i64> {
        self.credits
    }

    pub fn transport(&self) -> Transport {
        self.strategy.transport()
    }

    pub fn is_authenticated(&self) -> bool {
        self.strategy.is_authenticated()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.history.messages()
    }

    pub fn conversations(&self) -> &[Conversation] {
        self.history.conversations()
    }

    pub fn current_conversation_id(&self) -> Option<u64> {
        self.history.current_conversation_id()
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Conversation phase");
            self.phase = phase;
        }
    }

    fn fail(&mut self, content: &str) -> SendOutcome {
        self.enter(Phase::Error);
        self.history
            .append(ChatMessage::error(content, self.history.current_conversation_id()));
        SendOutcome::Failed
    }

    // ----- Sending -----

    /// Run one user turn to completion
    pub async fn send_message(&mut self, content: &str) -> SendOutcome {
        let outcome = self.dispatch(content).await;
        self.enter(Phase::Idle);
        outcome
    }

    async fn dispatch(&mut self, content: &str) -> SendOutcome {
        let resuming = self.resuming;
        let history = if resuming {
            self.replay_history(content)
        } else {
            self.history
                .append(ChatMessage::user(content, self.history.current_conversation_id()));
            self.history.history(None)
        };

        self.enter(Phase::RouterDecisionPending);
        let auth = self.strategy.request_auth();
        let decision = match self.gateway.route(&auth, content, &history).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "Router unavailable; answering without the agent");
                RouterDecision::new(RouterAction::NoAction).with_message(ROUTER_FALLBACK)
            }
        };
        tracing::info!(action = ?decision.action, resuming, "Router decision");

        match decision.action {
            RouterAction::NoAction => {
                self.enter(Phase::AnsweredDirectly);
                let answer = decision.explanation().unwrap_or_default();
                self.history
                    .append(ChatMessage::answer(answer, self.history.current_conversation_id()));
                SendOutcome::AnsweredDirectly
            }
            RouterAction::Authorize | RouterAction::NoCredit | RouterAction::OrderPlan => {
                let remedy = self.strategy.remedy(decision.action);
                self.halt(content, remedy, Blocked::Router(&decision)).await
            }
            RouterAction::Forward if !resuming && !self.strategy.can_forward(self.credits) => {
                tracing::info!(credits = ?self.credits, "Forward blocked by local credential check");
                let remedy = self.strategy.remedy(RouterAction::Forward);
                self.halt(content, remedy, Blocked::LocalCheck).await
            }
            RouterAction::Forward => self.forward(content, &history, &auth).await,
        }
    }

    /// History for a replay; the original user turn is normally still on
    /// the timeline
    fn replay_history(&self, content: &str) -> Vec<HistoryEntry> {
        let already_there = self
            .history
            .messages()
            .iter()
            .rev()
            .find(|m| m.is_user)
            .is_some_and(|m| m.content == content);
        self.history.history((!already_there).then_some(content))
    }

    async fn halt(&mut self, content: &str, remedy: Remedy, blocked: Blocked<'_>) -> SendOutcome {
        match remedy {
            Remedy::Checkout => self.offer_checkout(content, &blocked).await,
            Remedy::Authorize => self.offer_authorization(content, &blocked).await,
            Remedy::Exhausted => {
                let notice = match &blocked {
                    Blocked::Router(decision) => decision.explanation().unwrap_or(CREDITS_EXHAUSTED),
                    Blocked::LocalCheck => CREDITS_EXHAUSTED,
                };
                self.history
                    .append(ChatMessage::notice(notice, self.history.current_conversation_id()));
                SendOutcome::Exhausted
            }
        }
    }

    async fn offer_checkout(&mut self, content: &str, blocked: &Blocked<'_>) -> SendOutcome {
        self.enter(Phase::NeedsCheckout);
        let lead = match blocked {
            Blocked::Router(decision) => decision
                .explanation()
                .unwrap_or(match decision.action {
                    RouterAction::NoCredit => "You have no credits.",
                    _ => "Purchase is required to continue.",
                })
                .to_string(),
            Blocked::LocalCheck if self.strategy.is_authenticated() => "Insufficient credits.".to_string(),
            Blocked::LocalCheck => "No API Key found.".to_string(),
        };

        let parked = match self.strategy.remedy_url(Remedy::Checkout).await {
            Ok(url) => self
                .pending
                .park(&PendingAction::send_message(content), Parked::Checkout)
                .map(|()| url),
            Err(e) => Err(e),
        };

        match parked {
            Ok(url) => {
                tracing::info!("Checkout required; parked message for resumption");
                let notice = format!("{} Please complete the agent checkout: {}", lead, url);
                self.history
                    .append(ChatMessage::notice(notice, self.history.current_conversation_id()));
                SendOutcome::NeedsCheckout(url.into())
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not prepare checkout");
                self.fail(CHECKOUT_FAILED)
            }
        }
    }

    async fn offer_authorization(&mut self, content: &str, blocked: &Blocked<'_>) -> SendOutcome {
        self.enter(Phase::NeedsAuthorization);
        let prompt = match blocked {
            Blocked::Router(decision) => decision.explanation().unwrap_or(AUTHORIZE_PROMPT).to_string(),
            Blocked::LocalCheck => AUTHORIZE_PROMPT.to_string(),
        };

        if let Err(e) = self
            .pending
            .park(&PendingAction::send_message(content), Parked::Authorization)
        {
            tracing::error!(error = %e, "Could not park message before authorization");
            return self.fail(e.user_message());
        }

        match self.strategy.remedy_url(Remedy::Authorize).await {
            Ok(url) => {
                tracing::info!("Authorization required; parked message for resumption");
                self.history.append(ChatMessage::authorize(
                    prompt,
                    url.as_str(),
                    self.history.current_conversation_id(),
                ));
                SendOutcome::NeedsAuthorization(url.into())
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not prepare authorization URL");
                if let Err(clear) = self.pending.clear() {
                    tracing::warn!(error = %clear, "Could not drop parked message");
                }
                self.fail(e.user_message())
            }
        }
    }

    async fn forward(&mut self, content: &str, history: &[HistoryEntry], auth: &RequestAuth) -> SendOutcome {
        self.enter(Phase::Forward);

        let needs_conversation = self.history.current_conversation_id().is_none();
        let (title, catalog) = futures::join!(
            async {
                if needs_conversation {
                    Some(self.conversation_title(auth, history, content).await)
                } else {
                    None
                }
            },
            self.tool_catalog(auth),
        );
        let conversation_id = match title {
            Some(title) => self.history.create_conversation(title),
            None => self.history.current_conversation_id().unwrap_or_default(),
        };

        self.enter(Phase::IntentSynthesisPending);
        let intent = match self.gateway.synthesize_intent(auth, history, catalog.as_ref()).await {
            Ok(Intent::ToolCall(call)) => match catalog.as_ref().map(|c| c.validate(&call)) {
                Some(Err(e)) => Err(e),
                _ => Ok(Intent::ToolCall(call)),
            },
            other => other,
        };
        let intent = match intent {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(error = %e, "Intent synthesis failed");
                return self.fail(INTENT_FAILED);
            }
        };

        self.enter(Phase::AgentCallPending);
        let placeholder = self.history.append(ChatMessage::thinking(Some(conversation_id)));
        let reply = match &intent {
            Intent::Prompt(prompt) => self.gateway.call_agent(auth, prompt).await,
            Intent::ToolCall(call) => {
                tracing::debug!(tool = %call.tool, "Calling tool");
                self.gateway.call_tool(auth, call).await
            }
        };
        self.history.remove(&placeholder);

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "Agent call failed");
                return self.fail(AGENT_FAILED);
            }
        };

        self.history
            .append(ChatMessage::answer(&reply.response, Some(conversation_id)));

        if let Some((tx_hash, credits)) = reply.settlement() {
            tracing::info!(credits, tx_hash, "Credits redeemed");
            self.history.append(ChatMessage::transaction(
                credits,
                tx_hash,
                auth.plan_id.clone(),
                Some(conversation_id),
            ));
            self.append_cost(auth, credits, conversation_id).await;
        }

        self.refresh_credits().await;
        SendOutcome::Answered
    }

    async fn conversation_title(&self, auth: &RequestAuth, history: &[HistoryEntry], content: &str) -> String {
        match self.gateway.summarize_title(auth, history).await {
            Ok(title) if !title.trim().is_empty() => title.trim().to_string(),
            Ok(_) => fallback_title(content),
            Err(e) => {
                tracing::debug!(error = %e, "Title summarization failed; using message preview");
                fallback_title(content)
            }
        }
    }

    async fn tool_catalog(&self, auth: &RequestAuth) -> Option<ToolCatalog> {
        if !self.transport().supports_tools() {
            return None;
        }
        match self.gateway.list_tools(auth).await {
            Ok(catalog) => {
                tracing::debug!(tools = catalog.len(), "Fetched tool catalog");
                Some(catalog)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not list tools; synthesizing without a catalog");
                None
            }
        }
    }

    async fn append_cost(&mut self, auth: &RequestAuth, credits: i64, conversation_id: u64) {
        let cost = match self.gateway.plan_cost(auth).await {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch plan cost");
                return;
            }
        };
        match usd_cost(&cost, credits) {
            Ok(amount) => {
                self.history
                    .append(ChatMessage::usd_info(cost_message(amount), Some(conversation_id)));
            }
            Err(e) => tracing::warn!(error = %e, "Could not price redeemed credits"),
        }
    }

    // ----- Credits -----

    /// Refresh the balance for the badge
    pub async fn refresh_credits(&mut self) -> Option<i64> {
        self.credits = self.strategy.refresh_credits(self.gateway.as_ref()).await;
        tracing::debug!(credits = ?self.credits, "Refreshed credits");
        self.credits
    }

    /// React to a storage change made elsewhere; true when credits were
    /// refreshed
    pub async fn handle_storage_event(&mut self, key: &str) -> bool {
        if key != keys::CREDITS_UPDATED {
            return false;
        }
        self.refresh_credits().await;
        true
    }

    // ----- Timeline -----

    /// Drop every message, conversation and the parked action
    pub fn clear_history(&mut self) -> Result<()> {
        self.history.clear()?;
        self.pending.clear()
    }

    pub fn start_new_conversation(&mut self) {
        self.history.start_new();
    }

    /// Switch conversations; false for unknown ids
    pub fn select_conversation(&mut self, id: u64) -> bool {
        self.history.select(id)
    }

    // ----- Credentials -----

    /// Navigate straight to the remedy for this transport
    pub async fn connect(&self) -> Result<Navigation> {
        self.strategy.connect().await
    }

    pub fn logout(&mut self) -> Result<Navigation> {
        let navigation = self.strategy.logout()?;
        self.credits = None;
        Ok(navigation)
    }

    // ----- Resumption -----

    /// Consume checkout or authorization parameters from `url` (stripping
    /// them) and continue any parked action.
    pub async fn resume(&mut self, url: &mut Url) -> Result<Resumed> {
        let signal = self.accept_return(url).await?;

        let plan = plan_resume(signal, self.pending.is_parked()?, self.pending.checkout_pending()?);
        tracing::info!(?signal, ?plan, "Resuming after redirect");

        let replay = match plan {
            ResumePlan::Idle => {
                if signal != ReturnSignal::None {
                    self.refresh_credits().await;
                }
                None
            }
            ResumePlan::Discard => {
                self.pending.clear()?;
                None
            }
            ResumePlan::Replay => match self.pending.take()? {
                Some(action) => Some(self.replay(action).await),
                None => None,
            },
            ResumePlan::AwaitCredits => match self.pending.take()? {
                Some(action) => self.await_credits_then_replay(action).await,
                None => None,
            },
        };

        Ok(Resumed { signal, plan, replay })
    }

    async fn accept_return(&mut self, url: &mut Url) -> Result<ReturnSignal> {
        if let Some(returned) = CheckoutReturn::take(url) {
            tracing::info!(?returned, "Returned from checkout");
            self.strategy.accept_checkout_return(&returned)?;
            return Ok(ReturnSignal::Checkout);
        }

        let Some(params) = CallbackParams::take(url) else {
            return Ok(ReturnSignal::None);
        };

        match self.strategy.complete_callback(&params).await {
            Ok(true) => Ok(ReturnSignal::Authorized),
            Ok(false) => Ok(ReturnSignal::None),
            Err(e) => {
                tracing::error!(error = %e, "Authorization callback failed");
                if let Err(reset) = self.strategy.reset_authorization() {
                    tracing::warn!(error = %reset, "Could not clear authorization session");
                }
                self.history
                    .append(ChatMessage::error(e.to_string(), self.history.current_conversation_id()));
                Ok(ReturnSignal::AuthorizationFailed)
            }
        }
    }

    async fn await_credits_then_replay(&mut self, action: PendingAction) -> Option<SendOutcome> {
        let credits = {
            let source = GatewayCredits::new(self.gateway.as_ref(), self.strategy.as_ref());
            self.poller.wait_for_credits(&source).await
        };

        match credits {
            Some(credits) => {
                self.credits = Some(credits);
                Some(self.replay(action).await)
            }
            None => {
                self.history.append(ChatMessage::notice(
                    PURCHASE_NOT_COMPLETED,
                    self.history.current_conversation_id(),
                ));
                None
            }
        }
    }

    /// Send a parked action once, with the resume latch set
    async fn replay(&mut self, action: PendingAction) -> SendOutcome {
        self.resuming = true;
        let outcome = self.send_message(action.content()).await;
        self.resuming = false;
        tracing::info!(?outcome, "Replayed parked message");
        outcome
    }
}

/// Builder for [`ConversationMachine`]
#[derive(Default)]
pub struct ConversationMachineBuilder {
    gateway: Option<Arc<dyn Gateway>>,
    strategy: Option<Arc<dyn CredentialStrategy>>,
    store: Option<Arc<dyn KeyValueStore>>,
    poll: PollConfig,
}

impl ConversationMachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn CredentialStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Durable store for the timeline and the parked action
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn build(self) -> Result<ConversationMachine> {
        let gateway = self
            .gateway
            .ok_or_else(|| PaymentError::Config("Gateway is required".into()))?;
        let strategy = self
            .strategy
            .ok_or_else(|| PaymentError::Config("Credential strategy is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| PaymentError::Config("Durable store is required".into()))?;

        Ok(ConversationMachine {
            gateway,
            history: ChatHistory::load(store.clone(), strategy.transport()),
            pending: PendingActionStore::new(store),
            strategy,
            poller: CreditPoller::new(self.poll),
            phase: Phase::Idle,
            credits: None,
            resuming: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{AgentReply, MemoryStore, MessageKind, MockGateway, RouterDecision, ToolCall};
    use chat_payments::{
        ApiKeyStrategy, CheckoutConfig, CredentialStore, MockHttpClient, OAuthClient, OAuthConfig, OAuthStrategy,
    };
    use serde_json::json;

    const CALLBACK: &str = "http://localhost:8080/callback";
    const TOKEN: &str = "https://auth.example/token";
    const PARKED: &str = r#"{"type":"sendMessage","content":"weather in Rome"}"#;

    struct Harness {
        gateway: Arc<MockGateway>,
        durable: Arc<MemoryStore>,
        session: Arc<MemoryStore>,
        http: Arc<MockHttpClient>,
        transport: Transport,
    }

    impl Harness {
        fn api_key() -> Self {
            Self::new(Transport::Http)
        }

        fn oauth() -> Self {
            let harness = Self::new(Transport::Mcp);
            harness.http.on_get(
                "http://localhost:4002/.well-known/oauth-protected-resource",
                200,
                json!({"authorization_servers": ["https://auth.example"], "scopes_supported": ["weather.read"]}),
            );
            harness.http.on_get(
                "https://auth.example/.well-known/oauth-authorization-server",
                200,
                json!({
                    "authorization_endpoint": "https://auth.example/authorize",
                    "token_endpoint": TOKEN,
                    "registration_endpoint": "https://auth.example/register"
                }),
            );
            harness
                .http
                .on_post("https://auth.example/register", 201, json!({"client_id": "client-1"}));
            harness
        }

        fn new(transport: Transport) -> Self {
            Self {
                gateway: Arc::new(MockGateway::new()),
                durable: Arc::new(MemoryStore::new()),
                session: Arc::new(MemoryStore::new()),
                http: Arc::new(MockHttpClient::new()),
                transport,
            }
        }

        /// A fresh machine over the same stores, as after a page reload
        fn machine(&self) -> ConversationMachine {
            let credentials = Arc::new(CredentialStore::new(
                self.durable.clone(),
                self.session.clone(),
                self.transport,
            ));
            let strategy: Arc<dyn CredentialStrategy> = match self.transport {
                Transport::Http => Arc::new(ApiKeyStrategy::new(
                    credentials,
                    CheckoutConfig::new("agent-1", CALLBACK),
                )),
                Transport::Mcp => {
                    let client = OAuthClient::new(
                        OAuthConfig::new("http://localhost:4002/mcp", CALLBACK),
                        self.http.clone(),
                        credentials.clone(),
                    );
                    Arc::new(OAuthStrategy::new(credentials, Arc::new(client)))
                }
            };
            ConversationMachine::builder()
                .gateway(self.gateway.clone())
                .strategy(strategy)
                .store(self.durable.clone())
                .build()
                .unwrap()
        }

        fn parked(&self) -> Option<String> {
            self.durable.get(keys::PENDING_CHAT_ACTION).unwrap()
        }
    }

    fn kinds(machine: &ConversationMachine) -> Vec<MessageKind> {
        machine.messages().iter().map(|m| m.kind).collect()
    }

    fn last_content(machine: &ConversationMachine) -> String {
        machine.messages().last().map(|m| m.content.clone()).unwrap_or_default()
    }

    #[test]
    fn test_builder_requires_collaborators() {
        assert!(matches!(
            ConversationMachine::builder().build(),
            Err(PaymentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_runs_agent_and_prices_redemption() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.durable.set("nvmPlanId_http", "XYZ").unwrap();
        h.gateway
            .push_title("Weather in Rome")
            .push_reply(AgentReply {
                response: "Sunny".into(),
                tx_hash: Some("0xabc".into()),
                credits: Some(2),
                content: None,
            })
            .set_plan_cost("10", 100)
            .push_credits([Some(8)]);

        let mut machine = h.machine();
        let outcome = machine.send_message("weather in Rome").await;

        assert_eq!(outcome, SendOutcome::Answered);
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(
            kinds(&machine),
            vec![
                MessageKind::Answer,
                MessageKind::Answer,
                MessageKind::NvmTransactionUser,
                MessageKind::UsdInfo
            ]
        );
        assert!(machine.messages()[0].is_user);
        assert_eq!(machine.messages()[1].content, "Sunny");
        assert_eq!(machine.messages()[2].plan_id.as_deref(), Some("XYZ"));
        assert_eq!(last_content(&machine), "The final cost has been 0.2000 USDC.");
        assert_eq!(machine.conversations()[0].title, "Weather in Rome");
        assert_eq!(machine.credits(), Some(8));

        let calls = h.gateway.calls();
        assert_eq!(calls.agent_prompts, vec!["weather in Rome".to_string()]);
        assert_eq!(calls.tool_listings, 0);
        assert_eq!(calls.auths[0].bearer.as_deref(), Some("ABC"));
    }

    #[tokio::test]
    async fn test_router_failure_answers_without_agent() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_route_error();

        let mut machine = h.machine();
        assert_eq!(machine.send_message("hi").await, SendOutcome::AnsweredDirectly);
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Answer]);
        assert_eq!(last_content(&machine), ROUTER_FALLBACK);
        assert_eq!(h.gateway.calls().agent_calls(), 0);
        assert!(machine.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_no_action_uses_router_message() {
        let h = Harness::api_key();
        h.gateway
            .push_decision(RouterDecision::new(RouterAction::NoAction).with_message("Hello there!"));

        let mut machine = h.machine();
        machine.send_message("hi").await;
        assert_eq!(last_content(&machine), "Hello there!");
        assert_eq!(h.gateway.calls().intents.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_credits_offers_checkout() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway
            .push_credits([Some(0)])
            .push_decision(RouterDecision::new(RouterAction::NoCredit));

        let mut machine = h.machine();
        assert_eq!(machine.refresh_credits().await, Some(0));
        let outcome = machine.send_message("weather in Rome").await;

        let SendOutcome::NeedsCheckout(url) = outcome else {
            panic!("expected checkout, got {:?}", outcome);
        };
        assert!(url.starts_with("https://nevermined.dev/checkout/agent-1?returnUrl="));
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Notice]);
        assert_eq!(
            last_content(&machine),
            format!("You have no credits. Please complete the agent checkout: {}", url)
        );
        assert_eq!(h.parked().as_deref(), Some(PARKED));
        assert_eq!(h.durable.get(keys::CHECKOUT_PENDING).unwrap().as_deref(), Some("true"));
        assert_eq!(h.gateway.calls().agent_calls(), 0);
    }

    #[tokio::test]
    async fn test_order_plan_offers_checkout() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway
            .push_decision(RouterDecision::new(RouterAction::OrderPlan));

        let mut machine = h.machine();
        let outcome = machine.send_message("weather in Rome").await;

        let SendOutcome::NeedsCheckout(url) = outcome else {
            panic!("expected checkout, got {:?}", outcome);
        };
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Notice]);
        assert_eq!(
            last_content(&machine),
            format!("Purchase is required to continue. Please complete the agent checkout: {}", url)
        );
        assert_eq!(h.parked().as_deref(), Some(PARKED));
        assert_eq!(h.durable.get(keys::CHECKOUT_PENDING).unwrap().as_deref(), Some("true"));

        let calls = h.gateway.calls();
        assert_eq!(calls.agent_calls(), 0);
        assert!(calls.intents.is_empty());
    }

    #[tokio::test]
    async fn test_forward_without_key_is_blocked_locally() {
        let h = Harness::api_key();
        let mut machine = h.machine();

        let outcome = machine.send_message("weather in Rome").await;
        assert!(matches!(outcome, SendOutcome::NeedsCheckout(ref url) if url.contains("export=nvm-api-key")));
        assert!(last_content(&machine).starts_with("No API Key found. Please complete the agent checkout: "));
        assert_eq!(h.parked().as_deref(), Some(PARKED));
        assert_eq!(h.gateway.calls().intents.len(), 0);
    }

    #[tokio::test]
    async fn test_missing_agent_id_reports_checkout_failure() {
        let h = Harness::api_key();
        let credentials = Arc::new(CredentialStore::new(
            h.durable.clone(),
            h.session.clone(),
            Transport::Http,
        ));
        let mut machine = ConversationMachine::builder()
            .gateway(h.gateway.clone())
            .strategy(Arc::new(ApiKeyStrategy::new(credentials, CheckoutConfig::new("", CALLBACK))))
            .store(h.durable.clone())
            .build()
            .unwrap();

        assert_eq!(machine.send_message("weather").await, SendOutcome::Failed);
        assert_eq!(last_content(&machine), CHECKOUT_FAILED);
        assert!(h.parked().is_none());
    }

    #[tokio::test]
    async fn test_intent_failure_never_reaches_agent() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_intent_error();

        let mut machine = h.machine();
        assert_eq!(machine.send_message("weather").await, SendOutcome::Failed);
        assert_eq!(machine.messages().last().map(|m| m.kind), Some(MessageKind::Error));
        assert_eq!(last_content(&machine), INTENT_FAILED);
        assert_eq!(h.gateway.calls().agent_calls(), 0);
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_agent_failure_removes_placeholder() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_agent_error();

        let mut machine = h.machine();
        assert_eq!(machine.send_message("weather").await, SendOutcome::Failed);
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Error]);
        assert_eq!(last_content(&machine), AGENT_FAILED);
        assert_eq!(h.gateway.calls().credit_fetches, 0);

        // still usable
        assert_eq!(machine.send_message("again").await, SendOutcome::Answered);
    }

    #[tokio::test]
    async fn test_second_turn_reuses_conversation() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();

        let mut machine = h.machine();
        machine.send_message("first question").await;
        machine.send_message("second question").await;

        assert_eq!(machine.conversations().len(), 1);
        assert_eq!(machine.conversations()[0].title, "first question...");
        assert_eq!(h.gateway.calls().titles, 1);
        let history = &h.gateway.calls().intents[1];
        assert_eq!(history.first().map(|e| e.content.as_str()), Some("first question"));
        assert_eq!(history.last().map(|e| e.content.as_str()), Some("second question"));
    }

    #[tokio::test]
    async fn test_unauthenticated_oauth_user_is_asked_to_authorize() {
        let h = Harness::oauth();
        h.gateway
            .push_decision(RouterDecision::new(RouterAction::Authorize));

        let mut machine = h.machine();
        let outcome = machine.send_message("weather in Rome").await;

        assert!(matches!(outcome, SendOutcome::NeedsAuthorization(_)));
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Authorize]);
        let auth_url = machine.messages()[1].auth_url().unwrap();
        assert!(auth_url.starts_with("https://auth.example/authorize?response_type=code"));
        assert!(auth_url.contains("code_challenge_method=S256"));
        assert_eq!(h.parked().as_deref(), Some(PARKED));
        assert!(h.durable.get(keys::CHECKOUT_PENDING).unwrap().is_none());
        assert_eq!(h.gateway.calls().agent_calls(), 0);
    }

    #[tokio::test]
    async fn test_oauth_no_credit_before_login_authorizes() {
        let h = Harness::oauth();
        h.gateway
            .push_decision(RouterDecision::new(RouterAction::NoCredit));

        let mut machine = h.machine();
        let outcome = machine.send_message("weather in Rome").await;
        assert!(matches!(outcome, SendOutcome::NeedsAuthorization(_)));
    }

    #[tokio::test]
    async fn test_oauth_exhausted_plan_gets_notice() {
        let h = Harness::oauth();
        h.durable.set(keys::ACCESS_TOKEN, "tok").unwrap();
        h.gateway
            .push_decision(RouterDecision::new(RouterAction::OrderPlan));

        let mut machine = h.machine();
        assert_eq!(machine.send_message("weather").await, SendOutcome::Exhausted);
        assert_eq!(kinds(&machine), vec![MessageKind::Answer, MessageKind::Notice]);
        assert_eq!(last_content(&machine), CREDITS_EXHAUSTED);
        assert!(h.parked().is_none());
    }

    #[tokio::test]
    async fn test_mcp_tool_call_uses_catalog() {
        let h = Harness::oauth();
        h.durable.set(keys::ACCESS_TOKEN, "tok").unwrap();
        h.gateway
            .set_catalog(
                ToolCatalog::from_body(json!({"tools": [{"name": "weather.today", "description": "Weather"}]}))
                    .unwrap(),
            )
            .push_intent(Intent::ToolCall(ToolCall::new("weather.today").arg("city", "Rome")));

        let mut machine = h.machine();
        assert_eq!(machine.send_message("weather in Rome").await, SendOutcome::Answered);

        let calls = h.gateway.calls();
        assert_eq!(calls.tool_listings, 1);
        assert_eq!(calls.tool_calls.len(), 1);
        assert!(calls.agent_prompts.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_intent_failure() {
        let h = Harness::oauth();
        h.durable.set(keys::ACCESS_TOKEN, "tok").unwrap();
        h.gateway
            .set_catalog(
                ToolCatalog::from_body(json!({"tools": [{"name": "weather.today", "description": "Weather"}]}))
                    .unwrap(),
            )
            .push_intent(Intent::ToolCall(ToolCall::new("stocks.quote")));

        let mut machine = h.machine();
        assert_eq!(machine.send_message("quote").await, SendOutcome::Failed);
        assert_eq!(last_content(&machine), INTENT_FAILED);
        assert_eq!(h.gateway.calls().agent_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_return_replays_once_credits_arrive() {
        let h = Harness::api_key();
        let mut machine = h.machine();
        machine.send_message("weather in Rome").await;
        assert_eq!(h.parked().as_deref(), Some(PARKED));

        // reload on the return URL
        h.gateway.push_credits([None, None, Some(5)]);
        let mut machine = h.machine();
        let mut url = Url::parse("http://localhost:8080/callback?nvm-api-key=ABC&planId=XYZ").unwrap();
        let resumed = machine.resume(&mut url).await.unwrap();

        assert_eq!(url.as_str(), CALLBACK);
        assert_eq!(resumed.signal, ReturnSignal::Checkout);
        assert_eq!(resumed.plan, ResumePlan::AwaitCredits);
        assert_eq!(resumed.replay, Some(SendOutcome::Answered));
        assert_eq!(h.durable.get(keys::API_KEY).unwrap().as_deref(), Some("ABC"));
        assert_eq!(h.durable.get("nvmPlanId_http").unwrap().as_deref(), Some("XYZ"));
        assert!(h.parked().is_none());
        assert!(h.durable.get(keys::CHECKOUT_PENDING).unwrap().is_none());

        let calls = h.gateway.calls();
        assert_eq!(calls.routed.len(), 2);
        assert_eq!(calls.agent_prompts, vec!["weather in Rome".to_string()]);
        let user_turns = machine.messages().iter().filter(|m| m.is_user).count();
        assert_eq!(user_turns, 1);
        assert_eq!(machine.credits(), Some(5));

        // a second visit finds nothing to replay
        let mut url = Url::parse(CALLBACK).unwrap();
        let again = machine.resume(&mut url).await.unwrap();
        assert_eq!(again.plan, ResumePlan::Idle);
        assert_eq!(h.gateway.calls().agent_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_checkout_drops_message() {
        let h = Harness::api_key();
        h.durable.set(keys::PENDING_CHAT_ACTION, PARKED).unwrap();
        h.durable.set(keys::CHECKOUT_PENDING, "true").unwrap();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_credits([Some(0)]);

        let mut machine = h.machine();
        let mut url = Url::parse(CALLBACK).unwrap();
        let resumed = machine.resume(&mut url).await.unwrap();

        assert_eq!(resumed.plan, ResumePlan::AwaitCredits);
        assert_eq!(resumed.replay, None);
        assert_eq!(last_content(&machine), PURCHASE_NOT_COMPLETED);
        assert!(h.parked().is_none());
        assert!(h.gateway.calls().routed.is_empty());
    }

    #[tokio::test]
    async fn test_authorization_callback_replays_message() {
        let h = Harness::oauth();
        h.durable.set(keys::PENDING_CHAT_ACTION, PARKED).unwrap();
        h.session.set(keys::OAUTH_STATE, "s1").unwrap();
        h.session.set(keys::OAUTH_CODE_VERIFIER, "verifier-1").unwrap();
        h.session.set(keys::OAUTH_CLIENT_ID, "client-1").unwrap();
        h.http
            .on_post(TOKEN, 200, json!({"access_token": "tok-1", "token_type": "Bearer"}));

        let mut machine = h.machine();
        let mut url = Url::parse("http://localhost:8080/callback?code=c1&state=s1").unwrap();
        let resumed = machine.resume(&mut url).await.unwrap();

        assert_eq!(url.as_str(), CALLBACK);
        assert_eq!(resumed.signal, ReturnSignal::Authorized);
        assert_eq!(resumed.replay, Some(SendOutcome::Answered));
        assert_eq!(h.durable.get(keys::ACCESS_TOKEN).unwrap().as_deref(), Some("tok-1"));
        assert!(h.parked().is_none());

        let calls = h.gateway.calls();
        assert_eq!(calls.agent_calls(), 1);
        assert_eq!(calls.routed, vec!["weather in Rome".to_string()]);
        assert_eq!(calls.auths[0].bearer.as_deref(), Some("tok-1"));
        assert_eq!(h.http.requests_to(TOKEN).len(), 1);
    }

    #[tokio::test]
    async fn test_state_mismatch_stores_no_token() {
        let h = Harness::oauth();
        h.durable.set(keys::PENDING_CHAT_ACTION, PARKED).unwrap();
        h.session.set(keys::OAUTH_STATE, "s2").unwrap();
        h.session.set(keys::OAUTH_CODE_VERIFIER, "verifier-1").unwrap();

        let mut machine = h.machine();
        let mut url = Url::parse("http://localhost:8080/callback?code=c1&state=s1").unwrap();
        let resumed = machine.resume(&mut url).await.unwrap();

        assert_eq!(url.as_str(), CALLBACK);
        assert_eq!(resumed.signal, ReturnSignal::AuthorizationFailed);
        assert_eq!(resumed.plan, ResumePlan::Discard);
        assert_eq!(machine.messages().last().map(|m| m.kind), Some(MessageKind::Error));
        assert_eq!(last_content(&machine), "Invalid state parameter - possible CSRF attack");
        assert!(h.durable.get(keys::ACCESS_TOKEN).unwrap().is_none());
        assert!(h.http.requests_to(TOKEN).is_empty());
        assert!(h.parked().is_none());
        assert!(h.session.get(keys::OAUTH_STATE).unwrap().is_none());
        assert_eq!(h.gateway.calls().agent_calls(), 0);
    }

    #[tokio::test]
    async fn test_storage_event_refreshes_only_on_credit_key() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_credits([Some(3)]);

        let mut machine = h.machine();
        assert!(!machine.handle_storage_event("somethingElse").await);
        assert_eq!(h.gateway.calls().credit_fetches, 0);

        assert!(machine.handle_storage_event(keys::CREDITS_UPDATED).await);
        assert_eq!(machine.credits(), Some(3));
    }

    #[tokio::test]
    async fn test_clear_and_switch_conversations() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        let mut machine = h.machine();
        machine.send_message("first").await;
        machine.start_new_conversation();
        machine.send_message("second").await;

        assert_eq!(machine.conversations().len(), 2);
        assert_eq!(machine.current_conversation_id(), Some(2));
        assert!(machine.select_conversation(1));
        assert!(!machine.select_conversation(9));

        h.durable.set(keys::PENDING_CHAT_ACTION, PARKED).unwrap();
        machine.clear_history().unwrap();
        assert!(machine.messages().is_empty());
        assert!(machine.conversations().is_empty());
        assert!(h.parked().is_none());

        // nothing comes back after a reload
        assert!(h.machine().messages().is_empty());
    }

    #[tokio::test]
    async fn test_logout_forgets_credits() {
        let h = Harness::api_key();
        h.durable.set(keys::API_KEY, "ABC").unwrap();
        h.gateway.push_credits([Some(4)]);

        let mut machine = h.machine();
        machine.refresh_credits().await;
        let navigation = machine.logout().unwrap();

        assert_eq!(navigation, Navigation::Assign("/".into()));
        assert_eq!(machine.credits(), None);
        assert!(!machine.is_authenticated());
    }
}
