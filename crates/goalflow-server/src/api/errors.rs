//! Error responses for the Goalflow API
//!
//! Every failure is rendered as
//! `{"error": ..., "errorDetails": {"errorCode": ..., "errorMessage": ...}}`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use goalflow_core::CoreError;
use serde_json::json;
use tracing::error;

use crate::error::ServerError;

/// API error returned by handlers
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),
    /// Not found (404)
    NotFound(String),
    /// Wrapped server error
    ServerError(ServerError),
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError::ServerError(err)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::ServerError(err.into())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::ServerError(err) => write!(f, "Server Error: {}", err),
        }
    }
}

/// Status and error code for a server error
pub fn classify(err: &ServerError) -> (StatusCode, &'static str) {
    match err {
        ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
        ServerError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR"),
        ServerError::Conflict(_) => (StatusCode::CONFLICT, "ERR_CONFLICT"),
        ServerError::StaleResult(_) => (StatusCode::CONFLICT, "ERR_STALE_RESULT"),
        ServerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIGURATION"),
        ServerError::StoreError(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_STORE_UNAVAILABLE"),
        ServerError::InternalError(_) | ServerError::IoError(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND", msg.clone()),
            ApiError::ServerError(err) => {
                let (status, code) = classify(err);
                (status, code, err.to_string())
            }
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error_code, %message, "Request failed");
        }

        let body = Json(json!({
            "error": message,
            "errorDetails": {
                "errorCode": error_code,
                "errorMessage": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (CoreError::NoGoals, StatusCode::BAD_REQUEST),
            (CoreError::UnknownStep("x".into()), StatusCode::BAD_REQUEST),
            (CoreError::FlowNotFound("f".into()), StatusCode::NOT_FOUND),
            (CoreError::FlowExists("f".into()), StatusCode::CONFLICT),
            (CoreError::FlowTerminal("f".into()), StatusCode::CONFLICT),
            (CoreError::Store("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (CoreError::Other("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
