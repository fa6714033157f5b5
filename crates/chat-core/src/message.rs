//! Chat Messages
//!
//! Timeline entries shown to the user, and the reduced history sent to the
//! router and intent services.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a history entry as seen by the LLM services
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User input
    User,
    /// Anything the application or agent said
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Kind of timeline entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Regular answer (user turns use this kind too)
    Answer,
    /// Informational notice, e.g. a checkout link
    Notice,
    /// Recoverable failure shown inline
    Error,
    /// Placeholder while the agent works; removed, never edited
    Thinking,
    /// Carries an authorization URL the user must click
    Authorize,
    /// Credits were redeemed for the previous answer
    NvmTransactionUser,
    /// USD cost derived from a redemption
    UsdInfo,
    /// Non-fatal warning
    Warning,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Answer => "answer",
            MessageKind::Notice => "notice",
            MessageKind::Error => "error",
            MessageKind::Thinking => "thinking",
            MessageKind::Authorize => "authorize",
            MessageKind::NvmTransactionUser => "nvm-transaction-user",
            MessageKind::UsdInfo => "usd-info",
            MessageKind::Warning => "warning",
        }
    }
}

/// Unique message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Additional message metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Authorization URL for `authorize` messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Custom key-value pairs
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A single timeline entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,

    pub content: String,

    #[serde(rename = "type")]
    pub kind: MessageKind,

    pub is_user: bool,

    /// `None` until the first forwarded turn creates a conversation
    pub conversation_id: Option<u64>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,

    /// Credits redeemed, for transaction entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(
        kind: MessageKind,
        content: impl Into<String>,
        is_user: bool,
        conversation_id: Option<u64>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            kind,
            is_user,
            conversation_id,
            timestamp: Utc::now(),
            tx_hash: None,
            credits: None,
            plan_id: None,
            metadata: None,
        }
    }

    /// Create a user turn
    pub fn user(content: impl Into<String>, conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::Answer, content, true, conversation_id)
    }

    /// Create an assistant answer
    pub fn answer(content: impl Into<String>, conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::Answer, content, false, conversation_id)
    }

    pub fn notice(content: impl Into<String>, conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::Notice, content, false, conversation_id)
    }

    pub fn error(content: impl Into<String>, conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::Error, content, false, conversation_id)
    }

    pub fn thinking(conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::Thinking, "...", false, conversation_id)
    }

    /// Create an `authorize` message carrying the URL the user must open
    pub fn authorize(
        content: impl Into<String>,
        auth_url: impl Into<String>,
        conversation_id: Option<u64>,
    ) -> Self {
        let mut msg = Self::new(MessageKind::Authorize, content, false, conversation_id);
        msg.metadata = Some(MessageMetadata {
            auth_url: Some(auth_url.into()),
            ..Default::default()
        });
        msg
    }

    /// Create a redemption entry for credits burned by the agent
    pub fn transaction(
        credits: i64,
        tx_hash: impl Into<String>,
        plan_id: Option<String>,
        conversation_id: Option<u64>,
    ) -> Self {
        let plural = if credits == 1 { "" } else { "s" };
        let mut msg = Self::new(
            MessageKind::NvmTransactionUser,
            format!(
                "Task completed. {} credit{} have been deducted from your balance.",
                credits, plural
            ),
            false,
            conversation_id,
        );
        msg.tx_hash = Some(tx_hash.into());
        msg.credits = Some(credits);
        msg.plan_id = plan_id;
        msg
    }

    pub fn usd_info(content: impl Into<String>, conversation_id: Option<u64>) -> Self {
        Self::new(MessageKind::UsdInfo, content, false, conversation_id)
    }

    /// Authorization URL, for `authorize` messages
    pub fn auth_url(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.auth_url.as_deref())
    }

    /// Reduce to what the LLM services see
    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            role: if self.is_user { Role::User } else { Role::Assistant },
            content: self.content.clone(),
        }
    }

    /// Identity used to drop exact duplicates when hydrating from storage.
    /// Ids and timestamps are ignored.
    fn dedupe_key(&self) -> (String, MessageKind, bool, Option<u64>, String, Option<i64>, String) {
        (
            self.content.clone(),
            self.kind,
            self.is_user,
            self.conversation_id,
            self.tx_hash.clone().unwrap_or_default(),
            self.credits,
            self.plan_id.clone().unwrap_or_default(),
        )
    }
}

/// One turn of LLM-visible history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Ordered message timeline
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    messages: Vec<ChatMessage>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored messages, dropping exact duplicates
    pub fn from_stored(messages: Vec<ChatMessage>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let messages = messages
            .into_iter()
            .filter(|m| seen.insert(m.dedupe_key()))
            .collect();
        Self { messages }
    }

    /// Append a message
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Remove a message by id, returning it if present
    pub fn remove(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let pos = self.messages.iter().position(|m| &m.id == id)?;
        Some(self.messages.remove(pos))
    }

    /// Drop every `thinking` placeholder
    pub fn remove_placeholders(&mut self) {
        self.messages.retain(|m| m.kind != MessageKind::Thinking);
    }

    /// Get all messages
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// LLM-visible history, optionally followed by a pending user turn
    /// that is not (or not again) part of the timeline.
    pub fn history(&self, pending_user_turn: Option<&str>) -> Vec<HistoryEntry> {
        let mut history: Vec<HistoryEntry> = self
            .messages
            .iter()
            .filter(|m| m.kind != MessageKind::Thinking)
            .map(ChatMessage::to_history)
            .collect();
        if let Some(content) = pending_user_turn {
            history.push(HistoryEntry::user(content));
        }
        history
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
