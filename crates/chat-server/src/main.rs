//! Paywalled agent chat server
//!
//! Axum server hosting the chat API. Checkout and the OAuth authorization
//! server send the user back to `/callback`, where parked messages are
//! resumed.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use chat_core::{FileStore, KeyValueStore, MemoryStore};
use chat_runtime::{AppConfig, CALLBACK_PATH, ConversationMachine, HttpGateway, ReqwestHttpClient};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{
    callback, clear_chat, connect, health_check, list_messages, logout, new_conversation, select_conversation,
    send_chat, storage_event,
};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Chat API
        .route("/api/chat", post(send_chat))
        .route("/api/chat/messages", get(list_messages))
        .route("/api/chat/clear", post(clear_chat))
        .route("/api/chat/new", post(new_conversation))
        .route("/api/chat/select", post(select_conversation))
        .route("/api/chat/storage-event", post(storage_event))
        // Credentials
        .route("/api/auth/connect", get(connect))
        .route("/api/auth/logout", post(logout))
        .route(CALLBACK_PATH, get(callback))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let durable: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&config.storage_path)?);
    let session: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    tracing::info!(path = %config.storage_path.display(), "Opened state file");

    let http = Arc::new(ReqwestHttpClient::new(config.http_timeout));
    let gateway = Arc::new(HttpGateway::new(&config.api_base_url, config.http_timeout));
    let strategy = config.credential_strategy(durable.clone(), session, http);

    let mut machine = ConversationMachine::builder()
        .gateway(gateway)
        .strategy(strategy)
        .store(durable)
        .poll_config(config.poll)
        .build()?;

    if machine.is_authenticated() {
        match machine.refresh_credits().await {
            Some(credits) => tracing::info!(credits, "Credential loaded"),
            None => tracing::warn!("Credential loaded, balance unknown"),
        }
    } else {
        tracing::info!(transport = %config.transport, "No credential yet; connect via /api/auth/connect");
    }

    let addr = config.bind_addr.clone();
    tracing::info!(
        transport = %config.transport,
        agent_id = %config.agent_id,
        api = %config.api_base_url,
        callback = %config.redirect_uri(),
        "Chat server configured"
    );

    let app = router(AppState::new(machine, config));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Chat server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health              - Health check");
    tracing::info!("  GET  /api/chat/messages   - Timeline, conversations and credits");
    tracing::info!("  POST /api/chat            - Send message");
    tracing::info!("  GET  /api/auth/connect    - Start checkout or authorization");
    tracing::info!("  GET  {}              - Checkout / OAuth return", CALLBACK_PATH);

    axum::serve(listener, app).await?;

    Ok(())
}
