use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Conversation errors ──────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("Message '{id}' not found")]
    MessageNotFound { id: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Admission control ────────────────────────────────────────────────────
    #[error("Too many prompts, retry in {retry_after_seconds} seconds")]
    RateLimitExceeded { retry_after_seconds: u64 },

    // ── Generation backend errors ────────────────────────────────────────────
    #[error("Generation backend unavailable at {host}")]
    UpstreamUnavailable { host: String },

    #[error("Generation backend failure: {message}")]
    UpstreamFailure { message: String },

    #[error("cancelled by user")]
    StreamCancelled,

    // ── Caller identity ──────────────────────────────────────────────────────
    #[error("Missing caller identity")]
    Unauthenticated,

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        AppError::UpstreamFailure { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ConversationNotFound { .. } | AppError::MessageNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, AppError::UpstreamFailure { .. } | AppError::UpstreamUnavailable { .. })
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimitExceeded { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let host = e
                .url()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            AppError::UpstreamUnavailable { host }
        } else if e.is_timeout() {
            AppError::upstream("request to generation backend timed out")
        } else {
            AppError::upstream(e.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Unexpected(format!("JSON (de)serialization failed: {e}"))
    }
}
