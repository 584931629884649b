//! Error types for the Goalflow server

use goalflow_core::CoreError;
use goalflow_state_inmemory::StoreError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Request failed validation or planning
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Resource already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Late or duplicate step result
    #[error("Stale result: {0}")]
    StaleResult(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Snapshot store error
    #[error("Store error: {0}")]
    StoreError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::FlowNotFound(id) => ServerError::NotFound(format!("flow {}", id)),
            CoreError::ExecutionNotFound(id) => ServerError::NotFound(format!("execution {}", id)),
            CoreError::StepExists(_) | CoreError::FlowExists(_) => {
                ServerError::Conflict(err.to_string())
            }
            e if e.is_stale() => ServerError::StaleResult(e.to_string()),
            e if e.is_client_error() => ServerError::ValidationError(e.to_string()),
            CoreError::Store(msg) => ServerError::StoreError(msg),
            CoreError::Configuration(msg) => ServerError::ConfigError(msg),
            other => ServerError::InternalError(other.to_string()),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Configuration(msg) => ServerError::ConfigError(msg),
            other => ServerError::StoreError(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::ConfigError(err.to_string())
    }
}
