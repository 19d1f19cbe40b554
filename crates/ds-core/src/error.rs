//! Error types shared across the workspace.

/// Error returned by a settings store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend failure: {0}")]
    Backend(String),
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reason a settings value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);
