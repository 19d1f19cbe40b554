use ds_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Statistics storage error: {0}")]
    Store(#[from] StoreError),
}
