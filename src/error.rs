//! Error types for the pipeline board.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Label error: {0}")]
    Label(#[from] LabelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pipeline state store errors.
///
/// Validation failures are never retried; everything that can succeed on a
/// second attempt reports `is_retryable() == true`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid thread id {thread_id:?}: {reason}")]
    InvalidThreadId { thread_id: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found for thread {thread_id}")]
    NotFound { thread_id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Query(_))
    }
}

/// Label service errors (apply / remove).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("Failed to apply label {label:?} to email {email_id}: {reason}")]
    ApplyFailed {
        email_id: i64,
        label: String,
        reason: String,
    },

    #[error("Invalid confidence: {0} (must be 0-100)")]
    InvalidConfidence(i32),

    #[error("Label service unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for the pipeline board.
pub type Result<T> = std::result::Result<T, Error>;
