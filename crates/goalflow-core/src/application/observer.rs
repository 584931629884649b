use crate::domain::events::FlowEvent;
use crate::domain::step::Step;

/// Hook for instrumentation layered on top of the engine
///
/// Callbacks run on engine tasks after the flow lock is released and must
/// not block.
pub trait EngineObserver: Send + Sync {
    /// A lifecycle event was published
    fn on_event(&self, _event: &FlowEvent) {}

    /// A work item is about to run
    fn on_dispatch(&self, _step: &Step) {}

    /// A webhook result was rejected
    fn on_webhook_rejected(&self, _reason: &str) {}
}
