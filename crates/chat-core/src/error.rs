//! Error Types

use thiserror::Error;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat error types
#[derive(Error, Debug)]
pub enum ChatError {
    /// Transport-level failure talking to a backend endpoint
    #[error("Network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// Backend answered with a non-success status
    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    /// Backend answered, but the body did not match the contract
    #[error("Unexpected response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    /// Intent synthesis produced nothing usable
    #[error("Intent synthesis failed: {0}")]
    IntentUnavailable(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Shorthand for a network failure on `endpoint`
    pub fn network(endpoint: impl Into<String>, message: impl ToString) -> Self {
        ChatError::Network {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Network { .. } | ChatError::Io(_) => true,
            ChatError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Network { .. } => "The service could not be reached. Please try again.".into(),
            ChatError::Status { status: 401 | 403, .. } => "Your credentials were rejected.".into(),
            ChatError::Status { .. } | ChatError::InvalidResponse { .. } => {
                "The service returned an unexpected response. Please try again.".into()
            }
            ChatError::IntentUnavailable(_) => "Unable to synthesize intent. Please try again.".into(),
            ChatError::Config(msg) => format!("The application is misconfigured: {}", msg),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        ChatError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ChatError::network("/api/agent", "connection reset").is_retryable());
        assert!(ChatError::Status { endpoint: "/api/agent".into(), status: 503 }.is_retryable());
        assert!(!ChatError::Status { endpoint: "/api/agent".into(), status: 400 }.is_retryable());
        assert!(!ChatError::Config("missing".into()).is_retryable());
    }
}
