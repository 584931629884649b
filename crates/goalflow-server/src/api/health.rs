//! Health check endpoint

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::server::GoalflowServer;

/// Health check handler
pub async fn health_check(State(server): State<Arc<GoalflowServer>>) -> impl IntoResponse {
    debug!("Health check requested");
    let engine = server.engine();
    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "steps": engine.catalog().list().len(),
        "flows": engine.list_flows().await.len(),
        "pendingSnapshots": server.store().outstanding(),
    }))
}
