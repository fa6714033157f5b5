//! Payment Error Types

use chat_core::ChatError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Credential-acquisition errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Transport-level failure
    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    /// OAuth metadata could not be discovered
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration failed
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// No registration endpoint and no configured client id
    #[error("Client ID required but not found in registration or config")]
    ClientIdMissing,

    /// Authorization server reported an error on the callback
    #[error("Authorization error: {0}")]
    AuthorizationDenied(String),

    /// Callback state does not match the stored nonce
    #[error("Invalid state parameter - possible CSRF attack")]
    StateMismatch,

    /// PKCE verifier is gone; the flow must restart from discovery
    #[error("Code verifier not found in session")]
    VerifierMissing,

    /// Token endpoint rejected the code
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// No access token held
    #[error("No access token available - authorization required")]
    AuthorizationRequired,

    /// Checkout could not be prepared
    #[error("Checkout unavailable: {0}")]
    Checkout(String),

    /// Malformed URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the conversation layer
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Http { .. } | PaymentError::Discovery(_) | PaymentError::Storage(_) => true,
            PaymentError::Chat(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors that leave a poisoned authorization session behind
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            PaymentError::StateMismatch | PaymentError::VerifierMissing | PaymentError::AuthorizationDenied(_)
        )
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            PaymentError::AuthorizationDenied(_) => "Authorization was denied. Please try connecting again.",
            PaymentError::StateMismatch => "The authorization response could not be verified. Please try again.",
            PaymentError::VerifierMissing => "The authorization session expired. Please connect again.",
            PaymentError::TokenExchange(_) => "Authorization could not be completed. Please try again.",
            PaymentError::AuthorizationRequired => "Please connect your account to continue.",
            PaymentError::ClientIdMissing | PaymentError::Config(_) => "Service configuration error.",
            PaymentError::Checkout(_) => "Unable to redirect to checkout. Please try again.",
            _ => "An error occurred processing your request.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_match_flow_errors() {
        assert_eq!(
            PaymentError::StateMismatch.to_string(),
            "Invalid state parameter - possible CSRF attack"
        );
        assert_eq!(
            PaymentError::AuthorizationDenied("access_denied".into()).to_string(),
            "Authorization error: access_denied"
        );
        assert!(PaymentError::StateMismatch.requires_restart());
        assert!(!PaymentError::StateMismatch.is_retryable());
    }
}
