//! Flow lifecycle handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use goalflow_core::{Args, FlowContext, FlowDigest, FlowId, StepId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::server::GoalflowServer;

/// Body of `POST /api/flows`
#[derive(Debug, Deserialize)]
pub struct StartFlowRequest {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<FlowId>,
    pub goals: Vec<StepId>,
    #[serde(default)]
    pub init: Args,
}

pub async fn start_flow(
    State(server): State<Arc<GoalflowServer>>,
    Json(request): Json<StartFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = request
        .id
        .unwrap_or_else(|| FlowId(Uuid::new_v4().to_string()));
    info!(flow_id = %id, goals = request.goals.len(), "Starting flow");
    let flow = server
        .engine()
        .start_flow(id, &request.goals, request.init)
        .await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

pub async fn list_flows(State(server): State<Arc<GoalflowServer>>) -> Json<Vec<FlowDigest>> {
    Json(server.engine().list_flows().await)
}

pub async fn get_flow(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<Json<FlowContext>, ApiError> {
    let flow = server.engine().get_flow(&FlowId(id)).await?;
    Ok(Json(flow))
}

pub async fn cancel_flow(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<Json<FlowContext>, ApiError> {
    let flow = server.engine().cancel_flow(&FlowId(id)).await?;
    Ok(Json(flow))
}

/// Drop a finished flow and its snapshot
pub async fn forget_flow(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    server.engine().forget_flow(&FlowId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
