//! HTTP Handlers

use axum::{
    Json,
    extract::{OriginalUri, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use chat_core::{ChatMessage, Conversation};
use chat_payments::PaymentError;
use chat_runtime::{ConversationMachine, Phase, SendOutcome};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub transport: &'static str,
    pub authenticated: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    pub conversation_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageEventRequest {
    pub key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    pub messages: Vec<ChatMessage>,
    pub conversations: Vec<Conversation>,
    pub current_conversation_id: Option<u64>,
    pub credits: Option<i64>,
    pub phase: String,
}

impl TimelineResponse {
    fn of(machine: &ConversationMachine) -> Self {
        Self {
            messages: machine.messages().to_vec(),
            conversations: machine.conversations().to_vec(),
            current_conversation_id: machine.current_conversation_id(),
            credits: machine.credits(),
            phase: phase_label(machine.phase()).into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub outcome: &'static str,
    /// Checkout or authorization URL the user has to open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(flatten)]
    pub timeline: TimelineResponse,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

fn payment_error(e: &PaymentError) -> ApiError {
    tracing::error!(error = %e, "Request failed");
    let (status, code) = match e {
        PaymentError::AuthorizationRequired => (StatusCode::UNAUTHORIZED, "AUTHORIZATION_REQUIRED"),
        PaymentError::ClientIdMissing | PaymentError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
        PaymentError::Http { .. } | PaymentError::Discovery(_) | PaymentError::Registration(_) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR")
        }
        PaymentError::Checkout(_) => (StatusCode::BAD_GATEWAY, "CHECKOUT_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    api_error(status, code, e.user_message())
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Idle => "idle",
        Phase::RouterDecisionPending => "router_decision_pending",
        Phase::Forward => "forward",
        Phase::NeedsCheckout => "needs_checkout",
        Phase::NeedsAuthorization => "needs_authorization",
        Phase::AnsweredDirectly => "answered_directly",
        Phase::IntentSynthesisPending => "intent_synthesis_pending",
        Phase::AgentCallPending => "agent_call_pending",
        Phase::Error => "error",
    }
}

fn outcome_parts(outcome: SendOutcome) -> (&'static str, Option<String>) {
    match outcome {
        SendOutcome::Answered => ("answered", None),
        SendOutcome::AnsweredDirectly => ("answered_directly", None),
        SendOutcome::NeedsCheckout(url) => ("needs_checkout", Some(url)),
        SendOutcome::NeedsAuthorization(url) => ("needs_authorization", Some(url)),
        SendOutcome::Exhausted => ("exhausted", None),
        SendOutcome::Failed => ("failed", None),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let machine = state.machine.lock().await;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        transport: machine.transport().as_str(),
        authenticated: machine.is_authenticated(),
    })
}

pub async fn list_messages(State(state): State<AppState>) -> Json<TimelineResponse> {
    let machine = state.machine.lock().await;
    Json(TimelineResponse::of(&machine))
}

/// Run one chat turn
pub async fn send_chat(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let message = payload.message.trim();
    if message.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "EMPTY_MESSAGE", "Message must not be empty"));
    }

    let mut machine = state.machine.lock().await;
    let outcome = machine.send_message(message).await;
    tracing::info!(?outcome, "Chat turn finished");

    let (outcome, redirect_url) = outcome_parts(outcome);
    Ok(Json(SendResponse {
        outcome,
        redirect_url,
        timeline: TimelineResponse::of(&machine),
    }))
}

pub async fn clear_chat(State(state): State<AppState>) -> Result<Json<TimelineResponse>, ApiError> {
    let mut machine = state.machine.lock().await;
    machine.clear_history().map_err(|e| payment_error(&e))?;
    Ok(Json(TimelineResponse::of(&machine)))
}

pub async fn new_conversation(State(state): State<AppState>) -> Json<TimelineResponse> {
    let mut machine = state.machine.lock().await;
    machine.start_new_conversation();
    Json(TimelineResponse::of(&machine))
}

pub async fn select_conversation(
    State(state): State<AppState>,
    Json(payload): Json<SelectRequest>,
) -> Result<Json<TimelineResponse>, ApiError> {
    let mut machine = state.machine.lock().await;
    if !machine.select_conversation(payload.conversation_id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "UNKNOWN_CONVERSATION",
            format!("No conversation with id {}", payload.conversation_id),
        ));
    }
    Ok(Json(TimelineResponse::of(&machine)))
}

/// Storage change reported by another client
pub async fn storage_event(
    State(state): State<AppState>,
    Json(payload): Json<StorageEventRequest>,
) -> Json<TimelineResponse> {
    let mut machine = state.machine.lock().await;
    machine.handle_storage_event(&payload.key).await;
    Json(TimelineResponse::of(&machine))
}

/// Send the user to checkout or the authorization server
pub async fn connect(State(state): State<AppState>) -> Result<Redirect, ApiError> {
    let machine = state.machine.lock().await;
    let navigation = machine.connect().await.map_err(|e| payment_error(&e))?;
    Ok(Redirect::to(navigation.target()))
}

pub async fn logout(State(state): State<AppState>) -> Result<Redirect, ApiError> {
    let mut machine = state.machine.lock().await;
    let navigation = machine.logout().map_err(|e| payment_error(&e))?;
    Ok(Redirect::to(navigation.target()))
}

/// Checkout and OAuth return.
///
/// Consumed parameters are stripped and the browser is sent to the clean
/// URL; a visit without parameters just shows the timeline.
pub async fn callback(State(state): State<AppState>, OriginalUri(uri): OriginalUri) -> Result<Response, ApiError> {
    let mut url = Url::parse(&format!("{}{}", state.config.public_url, uri))
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_URL", e.to_string()))?;
    let requested = url.clone();

    let mut machine = state.machine.lock().await;
    let resumed = machine.resume(&mut url).await.map_err(|e| payment_error(&e))?;
    tracing::info!(signal = ?resumed.signal, plan = ?resumed.plan, "Handled return visit");

    if url == requested {
        return Ok(Json(TimelineResponse::of(&machine)).into_response());
    }
    Ok(Redirect::to(url.as_str()).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use chat_core::{KeyValueStore, MemoryStore, MockGateway, Transport, keys};
    use chat_payments::{ApiKeyStrategy, CheckoutConfig, CredentialStore};
    use chat_runtime::AppConfig;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixture {
        gateway: Arc<MockGateway>,
        durable: Arc<MemoryStore>,
        state: AppState,
    }

    fn fixture() -> Fixture {
        let config = AppConfig::default();
        let gateway = Arc::new(MockGateway::new());
        let durable = Arc::new(MemoryStore::new());
        let credentials = Arc::new(CredentialStore::new(
            durable.clone(),
            Arc::new(MemoryStore::new()),
            Transport::Http,
        ));
        let strategy = Arc::new(ApiKeyStrategy::new(
            credentials,
            CheckoutConfig::new("agent-1", config.redirect_uri()),
        ));
        let machine = ConversationMachine::builder()
            .gateway(gateway.clone())
            .strategy(strategy)
            .store(durable.clone())
            .build()
            .unwrap();
        Fixture {
            gateway,
            durable,
            state: AppState::new(machine, config),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_transport() {
        let f = fixture();
        let response = router(f.state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["transport"], "http");
        assert_eq!(body["authenticated"], false);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let f = fixture();
        let response = router(f.state)
            .oneshot(post_json("/api/chat", json!({"message": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "EMPTY_MESSAGE");
    }

    #[tokio::test]
    async fn test_chat_without_key_returns_checkout_url() {
        let f = fixture();
        let response = router(f.state)
            .oneshot(post_json("/api/chat", json!({"message": "weather in Rome"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["outcome"], "needs_checkout");
        assert!(body["redirectUrl"].as_str().unwrap().contains("/checkout/agent-1"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["type"], "notice");
        assert_eq!(body["phase"], "idle");
        assert!(f.durable.get(keys::PENDING_CHAT_ACTION).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chat_answer_with_key() {
        let f = fixture();
        f.durable.set(keys::API_KEY, "ABC").unwrap();
        let response = router(f.state)
            .oneshot(post_json("/api/chat", json!({"message": "weather in Rome"})))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["outcome"], "answered");
        assert!(body.get("redirectUrl").is_none());
        assert_eq!(body["conversations"].as_array().unwrap().len(), 1);
        assert_eq!(f.gateway.calls().agent_calls(), 1);
    }

    #[tokio::test]
    async fn test_checkout_callback_strips_params() {
        let f = fixture();
        let response = router(f.state)
            .oneshot(get("/callback?nvm-api-key=ABC&planId=XYZ"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION].to_str().unwrap(),
            "http://localhost:8080/callback"
        );
        assert_eq!(f.durable.get(keys::API_KEY).unwrap().as_deref(), Some("ABC"));
    }

    #[tokio::test]
    async fn test_plain_callback_shows_timeline() {
        let f = fixture();
        let response = router(f.state).oneshot(get("/callback")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_redirects_to_checkout() {
        let f = fixture();
        let response = router(f.state).oneshot(get("/api/auth/connect")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://nevermined.dev/checkout/agent-1?export=nvm-api-key"));
    }

    #[tokio::test]
    async fn test_logout_redirects_home() {
        let f = fixture();
        f.durable.set(keys::API_KEY, "ABC").unwrap();
        let response = router(f.state.clone())
            .oneshot(post_json("/api/auth/logout", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert!(f.durable.get(keys::API_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_unknown_conversation() {
        let f = fixture();
        let response = router(f.state)
            .oneshot(post_json("/api/chat/select", json!({"conversationId": 4})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
