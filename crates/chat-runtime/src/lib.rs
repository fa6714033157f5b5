//! # chat-runtime
//!
//! The conversation state machine plus the pieces that wire it to the
//! outside world.
//!
//! ## Adapters
//!
//! - **HTTP** (default): reqwest-backed [`HttpGateway`] and [`ReqwestHttpClient`]
//! - **Mock**: [`chat_core::MockGateway`] and [`chat_payments::MockHttpClient`] for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_runtime::{AppConfig, ConversationMachine, HttpGateway, ReqwestHttpClient};
//!
//! let config = AppConfig::from_env()?;
//! let strategy = config.credential_strategy(durable.clone(), session, http);
//! let mut machine = ConversationMachine::builder()
//!     .gateway(Arc::new(HttpGateway::new(&config.api_base_url, config.http_timeout)))
//!     .strategy(strategy)
//!     .store(durable)
//!     .poll_config(config.poll)
//!     .build()?;
//!
//! machine.send_message("weather in Rome").await;
//! ```

pub mod config;
pub mod machine;
pub mod resume;

#[cfg(feature = "http")]
pub mod http_gateway;
#[cfg(feature = "http")]
pub mod reqwest_client;

pub use config::{AppConfig, CALLBACK_PATH};
pub use machine::{ConversationMachine, ConversationMachineBuilder, Phase, Resumed, SendOutcome};
pub use resume::{plan_resume, ResumePlan, ReturnSignal};

#[cfg(feature = "http")]
pub use http_gateway::HttpGateway;
#[cfg(feature = "http")]
pub use reqwest_client::ReqwestHttpClient;

// Re-export the types callers handle directly
pub use chat_core::{ChatMessage, Conversation, KeyValueStore, MessageKind, Transport};
pub use chat_payments::{Navigation, PaymentError};
