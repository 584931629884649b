use goalflow_core::CoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the snapshot store adapters
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write-behind queue no longer accepts work
    #[error("Snapshot queue is closed")]
    Closed,

    /// A save did not finish in time
    #[error("Snapshot save timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid store settings
    #[error("Invalid store configuration: {0}")]
    Configuration(String),

    /// A worker task ended abnormally
    #[error("Snapshot worker failed: {0}")]
    Worker(String),

    /// Error from the wrapped store
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(inner) => inner,
            other => CoreError::Store(other.to_string()),
        }
    }
}
