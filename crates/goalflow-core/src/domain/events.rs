use crate::{FlowId, StepId, Token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events recorded by flows and published by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        flow_id: FlowId,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        flow_id: FlowId,
        timestamp: DateTime<Utc>,
    },
    FlowFailed {
        flow_id: FlowId,
        step_id: Option<StepId>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        flow_id: FlowId,
        step_id: StepId,
        work_items: usize,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        flow_id: FlowId,
        step_id: StepId,
        duration_ms: Option<i64>,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        flow_id: FlowId,
        step_id: StepId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        flow_id: FlowId,
        step_id: StepId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RetryScheduled {
        flow_id: FlowId,
        step_id: StepId,
        token: Token,
        retry_count: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    /// Dotted event name, e.g. `flow.started`
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow.started",
            FlowEvent::FlowCompleted { .. } => "flow.completed",
            FlowEvent::FlowFailed { .. } => "flow.failed",
            FlowEvent::StepStarted { .. } => "step.started",
            FlowEvent::StepCompleted { .. } => "step.completed",
            FlowEvent::StepFailed { .. } => "step.failed",
            FlowEvent::StepSkipped { .. } => "step.skipped",
            FlowEvent::RetryScheduled { .. } => "step.retry_scheduled",
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        match self {
            FlowEvent::FlowStarted { flow_id, .. }
            | FlowEvent::FlowCompleted { flow_id, .. }
            | FlowEvent::FlowFailed { flow_id, .. }
            | FlowEvent::StepStarted { flow_id, .. }
            | FlowEvent::StepCompleted { flow_id, .. }
            | FlowEvent::StepFailed { flow_id, .. }
            | FlowEvent::StepSkipped { flow_id, .. }
            | FlowEvent::RetryScheduled { flow_id, .. } => flow_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FlowEvent::FlowStarted { timestamp, .. }
            | FlowEvent::FlowCompleted { timestamp, .. }
            | FlowEvent::FlowFailed { timestamp, .. }
            | FlowEvent::StepStarted { timestamp, .. }
            | FlowEvent::StepCompleted { timestamp, .. }
            | FlowEvent::StepFailed { timestamp, .. }
            | FlowEvent::StepSkipped { timestamp, .. }
            | FlowEvent::RetryScheduled { timestamp, .. } => *timestamp,
        }
    }
}
