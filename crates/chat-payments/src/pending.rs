//! Pending Action Store
//!
//! Durable single slot holding the one chat message that must be replayed
//! after a checkout or authorization redirect.

use std::sync::Arc;

use chat_core::{keys, KeyValueStore};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Action awaiting resumption
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PendingAction {
    /// Resend a user message
    SendMessage { content: String },
}

impl PendingAction {
    pub fn send_message(content: impl Into<String>) -> Self {
        PendingAction::SendMessage {
            content: content.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            PendingAction::SendMessage { content } => content,
        }
    }
}

/// Why the action was parked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parked {
    /// Checkout redirect; also raises the `checkoutPending` flag
    Checkout,
    /// Authorization redirect
    Authorization,
}

/// Single-slot store under `pendingChatAction`
pub struct PendingActionStore {
    store: Arc<dyn KeyValueStore>,
}

impl PendingActionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Write the slot, overwriting any previous action
    pub fn park(&self, action: &PendingAction, reason: Parked) -> Result<()> {
        self.store
            .set(keys::PENDING_CHAT_ACTION, &serde_json::to_string(action)?)?;
        match reason {
            Parked::Checkout => self.store.set(keys::CHECKOUT_PENDING, "true")?,
            Parked::Authorization => self.store.remove(keys::CHECKOUT_PENDING)?,
        }
        tracing::debug!(?reason, "Parked pending chat action");
        Ok(())
    }

    /// Whether an action is parked; does not consume it
    pub fn is_parked(&self) -> Result<bool> {
        Ok(self.store.get(keys::PENDING_CHAT_ACTION)?.is_some())
    }

    pub fn checkout_pending(&self) -> Result<bool> {
        Ok(self
            .store
            .get(keys::CHECKOUT_PENDING)?
            .is_some_and(|flag| flag == "true"))
    }

    /// Read and clear the slot and the checkout flag.
    ///
    /// The slot is cleared before the record is interpreted, so a malformed
    /// record is discarded (with a warning) rather than retried forever.
    pub fn take(&self) -> Result<Option<PendingAction>> {
        let raw = self.store.get(keys::PENDING_CHAT_ACTION)?;
        self.clear()?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<PendingAction>(&raw) {
            Ok(action) => {
                tracing::info!("Took pending chat action");
                Ok(Some(action))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed pending chat action");
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(keys::PENDING_CHAT_ACTION)?;
        self.store.remove(keys::CHECKOUT_PENDING)?;
        Ok(())
    }
}
