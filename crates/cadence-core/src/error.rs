//! Error types shared across the Cadence crates.

use thiserror::Error;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    /// A launch/transition precondition did not hold.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An enqueue was rejected because a claimed job already exists for the contact.
    #[error("Job conflict: {0}")]
    JobConflict(String),

    #[error("History feed error: {0}")]
    Feed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CadenceError>;

/// Failure reported by a mailbox provider when sending.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Access token expired; refresh credentials and retry once.
    #[error("token expired")]
    TokenExpired,

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Timeouts, connection resets, provider 5xx.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Invalid recipient or a permanent rejection for this contact.
    #[error("permanent rejection: {0}")]
    Permanent(String),

    /// Mailbox consent revoked; affects every contact on the mailbox.
    #[error("credential revoked: {0}")]
    CredentialRevoked(String),
}

impl SendError {
    /// Whether the failure should go through the backoff path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::TokenExpired | SendError::RateLimited(_) | SendError::Transient(_)
        )
    }
}

/// Failure reported by a mailbox change feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// The stored cursor is older than the provider retains; a full resync is required.
    #[error("history cursor expired")]
    CursorExpired,

    #[error("feed fetch failed: {0}")]
    Fetch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SendError::TokenExpired.is_retryable());
        assert!(SendError::Transient("503".into()).is_retryable());
        assert!(SendError::RateLimited("slow down".into()).is_retryable());
        assert!(!SendError::Permanent("550 no such user".into()).is_retryable());
        assert!(!SendError::CredentialRevoked("invalid_grant".into()).is_retryable());
    }
}
