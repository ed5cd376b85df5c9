use thiserror::Error;

/// Failures surfaced by the remote document store and the local adapters
/// layered over it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl AppError {
    /// Store unreachable or too slow. Worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Network(_) | AppError::Timeout(_))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, AppError::PermissionDenied(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}
