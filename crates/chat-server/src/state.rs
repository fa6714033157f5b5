//! Application State

use std::sync::Arc;

use chat_runtime::{AppConfig, ConversationMachine};
use tokio::sync::Mutex;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The single conversation; one turn at a time
    pub machine: Arc<Mutex<ConversationMachine>>,

    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(machine: ConversationMachine, config: AppConfig) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            config: Arc::new(config),
        }
    }
}
