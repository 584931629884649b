//! Step catalog and plan preview handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use goalflow_core::{Args, CoreError, HealthState, Step, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::errors::ApiError;
use crate::server::GoalflowServer;

/// Body of `POST /api/plan`
#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub goals: Vec<StepId>,
    #[serde(default)]
    pub init: Args,
}

/// A catalog step together with its current health
#[derive(Debug, Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    pub health: HealthState,
}

pub async fn register_step(
    State(server): State<Arc<GoalflowServer>>,
    Json(step): Json<Step>,
) -> Result<impl IntoResponse, ApiError> {
    server.engine().catalog().register(step.clone())?;
    Ok((StatusCode::CREATED, Json(step)))
}

pub async fn update_step(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
    Json(step): Json<Step>,
) -> Result<Json<Step>, ApiError> {
    if step.id.0 != id {
        return Err(ApiError::BadRequest(format!(
            "step id '{}' does not match path '{}'",
            step.id, id
        )));
    }
    server
        .engine()
        .catalog()
        .update(step.clone())
        .map_err(|e| not_found_step(e, &id))?;
    Ok(Json(step))
}

pub async fn unregister_step(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<Json<Step>, ApiError> {
    let removed = server
        .engine()
        .catalog()
        .unregister(&StepId(id.clone()))
        .map_err(|e| not_found_step(e, &id))?;
    Ok(Json(removed))
}

pub async fn get_step(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<Json<StepView>, ApiError> {
    let engine = server.engine();
    let id = StepId(id);
    let step = engine
        .catalog()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("step {}", id)))?;
    let health = engine.health_of(&id).unwrap_or_default();
    Ok(Json(StepView { step, health }))
}

pub async fn list_steps(State(server): State<Arc<GoalflowServer>>) -> Json<Vec<StepView>> {
    let engine = server.engine();
    let mut health = engine.step_health();
    let views = engine
        .catalog()
        .list()
        .into_iter()
        .map(|step| {
            let health = health.remove(&step.id).unwrap_or_default();
            StepView { step, health }
        })
        .collect();
    Json(views)
}

/// Health of every step, `GET /api/health`
pub async fn list_step_health(
    State(server): State<Arc<GoalflowServer>>,
) -> Json<BTreeMap<StepId, HealthState>> {
    Json(server.engine().step_health())
}

pub async fn get_step_health(
    State(server): State<Arc<GoalflowServer>>,
    Path(id): Path<String>,
) -> Result<Json<HealthState>, ApiError> {
    let health = server
        .engine()
        .health_of(&StepId(id.clone()))
        .map_err(|e| not_found_step(e, &id))?;
    Ok(Json(health))
}

/// Plan without starting a flow
pub async fn preview_plan(
    State(server): State<Arc<GoalflowServer>>,
    Json(request): Json<PlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let plan = server.engine().plan(&request.goals, &request.init)?;
    Ok(Json(plan))
}

fn not_found_step(err: CoreError, id: &str) -> ApiError {
    match err {
        CoreError::UnknownStep(_) => ApiError::NotFound(format!("step {}", id)),
        other => other.into(),
    }
}
