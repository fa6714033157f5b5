//! Key-Value Storage
//!
//! Every piece of state that has to survive a redirect goes through a
//! [`KeyValueStore`]. Two scopes are used by the application: a durable one
//! (messages, credentials, the pending action) and a session one (OAuth
//! state and PKCE verifier).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::gateway::Transport;

/// Well-known storage keys
pub mod keys {
    /// Single-slot pending chat action
    pub const PENDING_CHAT_ACTION: &str = "pendingChatAction";
    /// Set while a checkout redirect is outstanding
    pub const CHECKOUT_PENDING: &str = "checkoutPending";
    /// API key returned by checkout (TTL'd)
    pub const API_KEY: &str = "nvmApiKey";
    /// OAuth access token (untimed)
    pub const ACCESS_TOKEN: &str = "mcp_access_token";
    /// Dynamically registered OAuth client id
    pub const CLIENT_ID: &str = "mcp_client_id";
    /// Cross-tab notification that credits were burned elsewhere
    pub const CREDITS_UPDATED: &str = "nvmCreditsUpdated";

    // Session scope
    pub const OAUTH_STATE: &str = "oauth_state";
    pub const OAUTH_CODE_VERIFIER: &str = "oauth_code_verifier";
    pub const OAUTH_CLIENT_ID: &str = "oauth_client_id";
}

/// Transport-scoped keys
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageKeys {
    transport: Transport,
}

impl StorageKeys {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn messages(&self) -> String {
        format!("chat_{}_messages", self.transport)
    }

    pub fn conversations(&self) -> String {
        format!("chat_{}_conversations", self.transport)
    }

    pub fn current_conversation_id(&self) -> String {
        format!("chat_{}_current_conversation_id", self.transport)
    }

    pub fn plan_id(&self) -> String {
        format!("nvmPlanId_{}", self.transport)
    }
}

/// Storage trait for string values with optional expiry
pub trait KeyValueStore: Send + Sync {
    /// Read a value; expired entries read as absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value without expiry
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Store a value that reads as absent once `ttl` has elapsed
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a value (no-op if absent)
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and deserialize a JSON value
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value without expiry
pub fn set_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.set(key, &serde_json::to_string(value)?)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Utc::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

fn poisoned<T>(_: T) -> ChatError {
    ChatError::Storage("store lock poisoned".into())
}

/// In-memory store (session scope, and tests)
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| !e.is_expired()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), Entry::new(value, None));
        Ok(())
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), Entry::new(value, Some(ttl)));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// JSON-file backed store; the whole map is rewritten on every change
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Entry>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened file store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, Entry>) -> Result<()> {
        let live: HashMap<&String, &Entry> =
            entries.iter().filter(|(_, e)| !e.is_expired()).collect();
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&live)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn write(&self, key: &str, entry: Option<Entry>) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entry {
            Some(entry) => entries.insert(key.to_string(), entry),
            None => entries.remove(key),
        };
        self.flush(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Some(Entry::new(value, None)))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write(key, Some(Entry::new(value, Some(ttl))))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None)
    }
}
