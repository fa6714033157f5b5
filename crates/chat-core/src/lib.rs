//! # chat-core
//!
//! Conversation model and backend contracts for the paywalled agent chat.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ChatHistory                           │
//! │  ┌─────────────┐  ┌───────────────┐  ┌───────────────────┐   │
//! │  │  Timeline   │  │ Conversations │  │  KeyValueStore    │   │
//! │  │ (messages)  │──│   (titles)    │──│  (memory / file)  │   │
//! │  └─────────────┘  └───────────────┘  └───────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                      Gateway (Strategy)
//!            router · intent · title · credit · agent
//! ```
//!
//! The `Gateway` trait keeps the conversation logic independent of how the
//! backend is reached; `MockGateway` scripts it for tests.

pub mod error;
pub mod gateway;
pub mod message;
pub mod mock;
pub mod session;
pub mod store;
pub mod tool;

pub use error::{ChatError, Result};
pub use gateway::{
    AgentReply, Gateway, Intent, PlanCost, RequestAuth, RouterAction, RouterDecision, Transport,
};
pub use message::{ChatMessage, HistoryEntry, MessageId, MessageKind, Role, Timeline};
pub use mock::{MockCalls, MockGateway};
pub use session::{fallback_title, ChatHistory, Conversation};
pub use store::{keys, FileStore, KeyValueStore, MemoryStore, StorageKeys};
pub use tool::{ToolCall, ToolCatalog, ToolSchema};
