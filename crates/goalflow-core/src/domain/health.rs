//! Step health
//!
//! HTTP steps that declare a health-check URL get a checked status. Every
//! other step is `unknown` unless something recorded a status for it. A
//! flow step is as healthy as the steps its nested goals plan to: the first
//! unhealthy one makes it unhealthy, otherwise the first unknown one that
//! carries an error makes it unknown, otherwise it is healthy.

use crate::domain::catalog::CatalogSnapshot;
use crate::domain::plan::create_plan;
use crate::domain::step::StepType;
use crate::StepId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Health of one step
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthState {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(error.into()),
        }
    }

    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            error: Some(error.into()),
        }
    }

    /// The state as seen through a flow step that depends on `step`
    fn through(&self, step: &StepId) -> Self {
        match (self.status, &self.error) {
            (HealthStatus::Healthy, _) => Self::healthy(),
            (HealthStatus::Unhealthy, Some(error)) => {
                Self::unhealthy(format!("step {}: {}", step, error))
            }
            (HealthStatus::Unhealthy, None) => Self::unhealthy(format!("step {} unhealthy", step)),
            (HealthStatus::Unknown, Some(error)) => Self::unknown(format!("step {}: {}", step, error)),
            (HealthStatus::Unknown, None) => Self::unknown(format!("step {} health unknown", step)),
        }
    }
}

/// Health of every catalog step, with flow steps derived from their plans
pub fn resolve_health(
    catalog: &CatalogSnapshot,
    recorded: &HashMap<StepId, HealthState>,
) -> BTreeMap<StepId, HealthState> {
    let mut resolver = Resolver {
        catalog,
        recorded,
        resolved: HashMap::new(),
        visiting: BTreeSet::new(),
    };
    catalog
        .steps()
        .map(|step| (step.id.clone(), resolver.resolve(&step.id)))
        .collect()
}

struct Resolver<'a> {
    catalog: &'a CatalogSnapshot,
    recorded: &'a HashMap<StepId, HealthState>,
    resolved: HashMap<StepId, HealthState>,
    visiting: BTreeSet<StepId>,
}

impl Resolver<'_> {
    fn resolve(&mut self, id: &StepId) -> HealthState {
        if let Some(health) = self.resolved.get(id) {
            return health.clone();
        }
        let health = self.compute(id);
        self.resolved.insert(id.clone(), health.clone());
        health
    }

    fn compute(&mut self, id: &StepId) -> HealthState {
        if let Some(health) = self.recorded.get(id) {
            if health.status != HealthStatus::Unknown {
                return health.clone();
            }
        }
        let Some(step) = self.catalog.get(id) else {
            return HealthState::unknown(format!("step not found: {}", id));
        };
        let goals = match (&step.step_type, &step.flow) {
            (StepType::Flow, Some(flow)) => flow.goals.clone(),
            _ => return self.recorded.get(id).cloned().unwrap_or_default(),
        };
        if !self.visiting.insert(id.clone()) {
            return HealthState::unknown(format!("flow health cycle at step {}", id));
        }

        let health = match create_plan(self.catalog, &goals, &BTreeSet::new()) {
            Err(e) => HealthState::unknown(format!("flow preview failed for {}: {}", id, e)),
            Ok(plan) => {
                let mut unknown = None;
                let mut unhealthy = None;
                for member in plan.steps.keys() {
                    let health = self.resolve(member);
                    match health.status {
                        HealthStatus::Unhealthy => {
                            unhealthy = Some(health.through(member));
                            break;
                        }
                        HealthStatus::Unknown if health.error.is_some() && unknown.is_none() => {
                            unknown = Some(health.through(member));
                        }
                        _ => {}
                    }
                }
                unhealthy.or(unknown).unwrap_or_else(HealthState::healthy)
            }
        };
        self.visiting.remove(id);
        health
    }
}
