//! Async step callbacks

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use goalflow_core::{FlowId, StepId, StepResult, Token};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::errors::ApiError;
use crate::server::GoalflowServer;

/// `POST /webhook/{flow_id}/{step_id}/{token}`
///
/// Accepts the same body a sync step returns. Superseded tokens and results
/// for finished steps answer 409.
pub async fn step_result(
    State(server): State<Arc<GoalflowServer>>,
    Path((flow_id, step_id, token)): Path<(String, String, String)>,
    Json(result): Json<StepResult>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    server
        .engine()
        .handle_step_result(&FlowId(flow_id), &StepId(step_id), &Token(token), result)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}
