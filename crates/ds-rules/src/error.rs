//! Error types for rule compilation and synchronization.

use ds_core::StoreError;

/// Error reported by the interception engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Rule {id} rejected: {reason}")]
    InvalidRule { id: u32, reason: String },
    #[error("Rule quota exceeded: {requested} rules requested, limit {limit}")]
    QuotaExceeded { requested: usize, limit: usize },
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Error surfaced by the rule synchronizer and the rule-ID allocator.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Settings store error: {0}")]
    Store(#[from] StoreError),
    #[error("Interception engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("No more site-specific rule slots available")]
    OffsetSpaceExhausted,
    #[error("Rule synchronizer already started")]
    AlreadyStarted,
}
