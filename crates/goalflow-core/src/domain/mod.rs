/// Attribute declarations
pub mod attribute;

/// Step definitions
pub mod step;

/// Step catalog
pub mod catalog;

/// Execution planning
pub mod plan;

/// Flow aggregate and state machine
pub mod flow;

/// Retry policy
pub mod retry;

/// Work item fan-out
pub mod work;

/// Domain events
pub mod events;

/// Snapshot persistence interfaces
pub mod repository;

/// Step health resolution
pub mod health;
