//!
//! Goalflow Core - planner and runtime for goal-driven workflows
//!
//! Steps are registered in a catalog with the attributes they consume and
//! produce. A flow is started by naming goal steps; the planner derives the
//! set of steps needed to reach them and the engine runs those steps as
//! their inputs become available, retrying failures with backoff.

#![forbid(unsafe_code)]

/// Domain layer - catalog, planning and the flow state machine
pub mod domain;

/// Application services - engine, dispatch and scripting
pub mod application;

/// Core identifiers and value containers
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::CoreError;
pub use types::{Args, FlowId, StepId, Token};

pub use domain::attribute::{AttributeMapping, AttributeRole, AttributeSpec, AttributeType};
pub use domain::catalog::{CatalogSnapshot, StepCatalog};
pub use domain::events::FlowEvent;
pub use domain::health::{resolve_health, HealthState, HealthStatus};
pub use domain::flow::{
    ErrorState, ExecutionState, ExecutionStatus, FlowContext, FlowDigest, FlowStatus,
    WorkItemState,
};
pub use domain::plan::{create_plan, ExecutionPlan};
pub use domain::repository::{NullSnapshotStore, SnapshotKey, SnapshotStore};
pub use domain::retry::RetryPolicy;
pub use domain::step::{
    BackoffType, HttpConfig, ScriptConfig, Step, StepType, SubflowConfig, WorkConfig,
};

pub use application::config::EngineConfig;
pub use application::dispatch::{
    HttpStepClient, RequestMetadata, StepClient, StepRequest, StepResult, WorkOutcome,
};
pub use application::engine::{Engine, EngineBuilder};
pub use application::observer::EngineObserver;
