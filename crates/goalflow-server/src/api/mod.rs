//! API routes for the Goalflow server

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod errors;
pub mod flows;
pub mod health;
pub mod steps;
pub mod webhook;

use crate::server::GoalflowServer;

/// Build the router for API endpoints
pub fn build_router(server: Arc<GoalflowServer>) -> Router {
    Router::new()
        // Step catalog
        .route("/api/steps", post(steps::register_step).get(steps::list_steps))
        .route(
            "/api/steps/:id",
            get(steps::get_step)
                .put(steps::update_step)
                .delete(steps::unregister_step),
        )
        .route("/api/plan", post(steps::preview_plan))
        .route("/api/health", get(steps::list_step_health))
        .route("/api/health/:id", get(steps::get_step_health))
        // Flows
        .route("/api/flows", post(flows::start_flow).get(flows::list_flows))
        .route(
            "/api/flows/:id",
            get(flows::get_flow).delete(flows::forget_flow),
        )
        .route("/api/flows/:id/cancel", post(flows::cancel_flow))
        // Async step callbacks
        .route(
            "/webhook/:flow_id/:step_id/:token",
            post(webhook::step_result),
        )
        .route("/health", get(health::health_check))
        .with_state(server)
}
