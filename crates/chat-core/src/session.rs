//! Conversation History
//!
//! The message timeline plus the conversation list, hydrated from and
//! persisted to a [`KeyValueStore`] under transport-scoped keys.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gateway::Transport;
use crate::message::{ChatMessage, HistoryEntry, MessageId, Timeline};
use crate::store::{get_json, keys, set_json, KeyValueStore, StorageKeys};

/// Characters of the first message used when no title could be synthesized
const FALLBACK_TITLE_CHARS: usize = 30;

/// Conversation metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Title used when summarization is unavailable
pub fn fallback_title(content: &str) -> String {
    let preview: String = content.chars().take(FALLBACK_TITLE_CHARS).collect();
    format!("{}...", preview)
}

/// Timeline and conversations for one transport
pub struct ChatHistory {
    store: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    timeline: Timeline,
    conversations: Vec<Conversation>,
    current: Option<u64>,
}

impl ChatHistory {
    /// Hydrate from storage.
    ///
    /// Exact duplicate messages, leftover `thinking` placeholders and
    /// repeated conversation ids are dropped, conversations are ordered
    /// newest first. Unreadable records start
    /// empty rather than failing.
    pub fn load(store: Arc<dyn KeyValueStore>, transport: Transport) -> Self {
        let keys = StorageKeys::new(transport);

        let messages: Vec<ChatMessage> = get_json(store.as_ref(), &keys.messages())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Discarding unreadable message history");
                None
            })
            .unwrap_or_default();

        let stored: Vec<Conversation> = get_json(store.as_ref(), &keys.conversations())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Discarding unreadable conversation list");
                None
            })
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut conversations: Vec<Conversation> =
            stored.into_iter().filter(|c| seen.insert(c.id)).collect();
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let current = store
            .get(&keys.current_conversation_id())
            .ok()
            .flatten()
            .and_then(|raw| raw.trim().parse().ok());

        let mut timeline = Timeline::from_stored(messages);
        timeline.remove_placeholders();
        tracing::debug!(
            transport = %transport,
            messages = timeline.len(),
            conversations = conversations.len(),
            "Hydrated chat history"
        );

        Self {
            store,
            keys,
            timeline,
            conversations,
            current,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.timeline.messages()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn current_conversation_id(&self) -> Option<u64> {
        self.current
    }

    /// LLM-visible history
    pub fn history(&self, pending_user_turn: Option<&str>) -> Vec<HistoryEntry> {
        self.timeline.history(pending_user_turn)
    }

    /// Append a message and persist
    pub fn append(&mut self, message: ChatMessage) -> MessageId {
        let id = message.id.clone();
        self.timeline.push(message);
        self.persist_messages();
        id
    }

    /// Remove a message (the `thinking` placeholder) and persist
    pub fn remove(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let removed = self.timeline.remove(id);
        if removed.is_some() {
            self.persist_messages();
        }
        removed
    }

    /// Create a conversation, make it current, and return its id
    pub fn create_conversation(&mut self, title: impl Into<String>) -> u64 {
        let id = self.conversations.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        self.conversations.insert(0, Conversation::new(id, title));
        self.current = Some(id);
        self.persist_conversations();
        self.persist_current();
        tracing::info!(conversation_id = id, "Started conversation");
        id
    }

    /// Detach from the current conversation; the next forwarded turn creates one
    pub fn start_new(&mut self) {
        self.current = None;
        self.persist_current();
    }

    /// Switch to a known conversation; returns false for unknown ids
    pub fn select(&mut self, id: u64) -> bool {
        if !self.conversations.iter().any(|c| c.id == id) {
            return false;
        }
        self.current = Some(id);
        self.persist_current();
        true
    }

    /// Remove every message, conversation and the pending chat action
    pub fn clear(&mut self) -> Result<()> {
        self.timeline.clear();
        self.conversations.clear();
        self.current = None;

        self.store.remove(&self.keys.messages())?;
        self.store.remove(&self.keys.conversations())?;
        self.store.remove(&self.keys.current_conversation_id())?;
        self.store.remove(keys::PENDING_CHAT_ACTION)?;
        tracing::info!("Cleared chat history");
        Ok(())
    }

    fn persist_messages(&self) {
        if let Err(e) = set_json(self.store.as_ref(), &self.keys.messages(), &self.timeline) {
            tracing::error!(error = %e, "Failed to persist messages");
        }
    }

    fn persist_conversations(&self) {
        if let Err(e) = set_json(self.store.as_ref(), &self.keys.conversations(), &self.conversations) {
            tracing::error!(error = %e, "Failed to persist conversations");
        }
    }

    fn persist_current(&self) {
        let key = self.keys.current_conversation_id();
        let result = match self.current {
            Some(id) => self.store.set(&key, &id.to_string()),
            None => self.store.remove(&key),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to persist current conversation id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn history() -> (Arc<MemoryStore>, ChatHistory) {
        let store = Arc::new(MemoryStore::new());
        let history = ChatHistory::load(store.clone(), Transport::Http);
        (store, history)
    }

    #[test]
    fn test_fallback_title() {
        assert_eq!(fallback_title("short"), "short...");
        let long = "What is the weather going to be like in Rome tomorrow?";
        assert_eq!(fallback_title(long), "What is the weather going to b...");
    }

    #[test]
    fn test_persist_and_rehydrate() {
        let (store, mut history) = history();
        history.append(ChatMessage::user("Hi", None));
        let id = history.create_conversation("Greeting");
        history.append(ChatMessage::answer("Hello", Some(id)));

        let reloaded = ChatHistory::load(store, Transport::Http);
        assert_eq!(reloaded.messages().len(), 2);
        assert_eq!(reloaded.current_conversation_id(), Some(id));
        assert_eq!(reloaded.conversations()[0].title, "Greeting");
    }

    #[test]
    fn test_interrupted_turn_leaves_no_placeholder() {
        let (store, mut history) = history();
        history.append(ChatMessage::user("Hi", None));
        history.append(ChatMessage::thinking(None));

        let reloaded = ChatHistory::load(store, Transport::Http);
        assert_eq!(reloaded.messages().len(), 1);
        assert!(reloaded.messages()[0].is_user);
    }

    #[test]
    fn test_conversations_newest_first_and_unique() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let stored = vec![
            Conversation { id: 1, title: "old".into(), timestamp: now - Duration::hours(2) },
            Conversation { id: 2, title: "new".into(), timestamp: now },
            Conversation { id: 1, title: "dup".into(), timestamp: now },
        ];
        set_json(store.as_ref(), &StorageKeys::new(Transport::Mcp).conversations(), &stored).unwrap();

        let history = ChatHistory::load(store, Transport::Mcp);
        let ids: Vec<u64> = history.conversations().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_select_and_start_new() {
        let (store, mut history) = history();
        let first = history.create_conversation("one");
        let second = history.create_conversation("two");
        assert_eq!(second, first + 1);

        assert!(history.select(first));
        assert!(!history.select(99));
        assert_eq!(history.current_conversation_id(), Some(first));

        history.start_new();
        assert_eq!(history.current_conversation_id(), None);
        assert!(store.get("chat_http_current_conversation_id").unwrap().is_none());
    }

    #[test]
    fn test_clear_removes_pending_action() {
        let (store, mut history) = history();
        history.append(ChatMessage::user("Hi", None));
        history.create_conversation("Hi...");
        store.set(keys::PENDING_CHAT_ACTION, r#"{"type":"sendMessage","content":"Hi"}"#).unwrap();

        history.clear().unwrap();
        assert!(history.messages().is_empty());
        assert!(history.conversations().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_unreadable_history_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("chat_http_messages", "not json").unwrap();
        let history = ChatHistory::load(store, Transport::Http);
        assert!(history.messages().is_empty());
    }
}
