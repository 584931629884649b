//! Periodic health checks of HTTP steps
//!
//! Steps that declare `http.health_check` are checked with a GET on every
//! pass. A step that completed work within the success window counts as
//! healthy without a request.

use crate::application::engine::Engine;
use crate::domain::health::{resolve_health, HealthState};
use crate::{CoreError, StepId};
use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl Engine {
    /// Run [`Engine::check_step_health`] every `health_check_interval_ms`
    pub fn spawn_health_loop(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            info!("Health checker started");
            let mut ticker = tokio::time::interval(engine.config().health_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.check_step_health().await;
            }
        })
    }

    /// One check pass over every HTTP step with a health-check URL
    pub async fn check_step_health(&self) {
        let snapshot = self.catalog().snapshot();
        self.recorded_health().retain(|id, _| snapshot.contains(id));

        let targets: Vec<(StepId, String)> = snapshot
            .steps()
            .filter_map(|step| {
                let url = step.http.as_ref()?.health_check.clone()?;
                Some((step.id.clone(), url))
            })
            .collect();
        debug!(steps = targets.len(), "Health check pass");

        let window = self.config().health_success_window();
        let timeout = self.config().health_check_timeout();
        for (id, url) in targets {
            let recent = self
                .last_success()
                .get(&id)
                .is_some_and(|at| at.elapsed() < window);
            let health = if recent {
                HealthState::healthy()
            } else {
                match self.step_client().check_health(&url, timeout).await {
                    Ok(()) => HealthState::healthy(),
                    Err(e) => {
                        warn!(step_id = %id, url = %url, error = %e, "Health check failed");
                        HealthState::unhealthy(check_error(e))
                    }
                }
            };
            self.update_step_health(&id, health);
        }
    }

    /// Record a step's health, returning whether it changed
    pub fn update_step_health(&self, id: &StepId, health: HealthState) -> bool {
        let changed = self
            .recorded_health()
            .get(id)
            .map_or(true, |current| *current != health);
        if changed {
            info!(step_id = %id, status = ?health.status, error = ?health.error, "Step health changed");
            self.recorded_health().insert(id.clone(), health);
        }
        changed
    }

    /// Health of every catalog step, flow steps derived from their plans
    pub fn step_health(&self) -> BTreeMap<StepId, HealthState> {
        let recorded: HashMap<StepId, HealthState> = self
            .recorded_health()
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        resolve_health(&self.catalog().snapshot(), &recorded)
    }

    /// Health of one catalog step
    pub fn health_of(&self, id: &StepId) -> Result<HealthState, CoreError> {
        self.step_health()
            .remove(id)
            .ok_or_else(|| CoreError::UnknownStep(id.0.clone()))
    }
}

fn check_error(err: CoreError) -> String {
    match err {
        CoreError::Transport(message) | CoreError::Timeout(message) => message,
        other => other.to_string(),
    }
}
