//! Session cache errors.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session cache errors.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No tokenizer exists for the requested model.
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// The prompt provider does not know the prompt name.
    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    /// Backend read/write failure, passed through uninterpreted.
    #[error("Store error: {0}")]
    Store(String),

    /// Stored blob does not match the session schema.
    #[error("Schema error for {key}: {reason}")]
    Schema { key: String, reason: String },

    /// State could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Releasing the tokenizer binding failed.
    #[error("Tokenizer release error: {0}")]
    Release(String),

    /// The creation lock is held by another request.
    #[error("Session lock busy: {0}")]
    LockBusy(String),

    /// Invalid store or tokenizer configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Configuration errors are raised before anything is constructed.
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedModel(_) | Self::UnknownPrompt(_) | Self::Config(_)
        )
    }

    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema { .. })
    }
}

impl From<SessionError> for copilot_common::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnsupportedModel(_)
            | SessionError::UnknownPrompt(_)
            | SessionError::Config(_) => Self::Config(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
