//! Engine metrics recorded through the `metrics` facade

use goalflow_core::{EngineObserver, FlowEvent, Step};
use metrics::{
    describe_counter, describe_histogram, histogram, increment_counter, Unit,
};
use tracing::info;

use crate::MonitoringConfig;

pub const FLOWS_STARTED: &str = "goalflow_flows_started_total";
pub const FLOWS_COMPLETED: &str = "goalflow_flows_completed_total";
pub const STEP_DISPATCHES: &str = "goalflow_step_dispatches_total";
pub const STEP_RETRIES: &str = "goalflow_step_retries_total";
pub const WEBHOOKS_REJECTED: &str = "goalflow_webhooks_rejected_total";
pub const STEP_DURATION: &str = "goalflow_step_duration_ms";

/// Install the Prometheus exporter when an address is configured
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MonitoringConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    use metrics_exporter_prometheus::PrometheusBuilder;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }
    EngineMetrics::describe();
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MonitoringConfig) -> anyhow::Result<()> {
    if config.metrics_addr.is_some() {
        anyhow::bail!("metrics_addr is set but the prometheus feature is disabled");
    }
    EngineMetrics::describe();
    info!("Metrics recorded without an exporter");
    Ok(())
}

/// What an engine event contributes to the metrics
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EventMetric {
    FlowStarted,
    FlowFinished(&'static str),
    Retry,
    StepDuration(f64),
}

pub(crate) fn classify(event: &FlowEvent) -> Option<EventMetric> {
    match event {
        FlowEvent::FlowStarted { .. } => Some(EventMetric::FlowStarted),
        FlowEvent::FlowCompleted { .. } => Some(EventMetric::FlowFinished("completed")),
        FlowEvent::FlowFailed { .. } => Some(EventMetric::FlowFinished("failed")),
        FlowEvent::RetryScheduled { .. } => Some(EventMetric::Retry),
        FlowEvent::StepCompleted {
            duration_ms: Some(ms),
            ..
        } => Some(EventMetric::StepDuration(*ms as f64)),
        _ => None,
    }
}

/// Engine observer feeding the global metrics recorder
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineMetrics;

impl EngineMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Register metric descriptions with the installed recorder
    pub fn describe() {
        describe_counter!(FLOWS_STARTED, "Flows started");
        describe_counter!(FLOWS_COMPLETED, "Flows that reached a terminal status");
        describe_counter!(STEP_DISPATCHES, "Work items dispatched, by step type");
        describe_counter!(STEP_RETRIES, "Retries scheduled after a failed work item");
        describe_counter!(WEBHOOKS_REJECTED, "Webhook results rejected by the engine");
        describe_histogram!(STEP_DURATION, Unit::Milliseconds, "Step execution time");
    }
}

impl EngineObserver for EngineMetrics {
    fn on_event(&self, event: &FlowEvent) {
        match classify(event) {
            Some(EventMetric::FlowStarted) => increment_counter!(FLOWS_STARTED),
            Some(EventMetric::FlowFinished(status)) => {
                increment_counter!(FLOWS_COMPLETED, "status" => status)
            }
            Some(EventMetric::Retry) => increment_counter!(STEP_RETRIES),
            Some(EventMetric::StepDuration(ms)) => histogram!(STEP_DURATION, ms),
            None => {}
        }
    }

    fn on_dispatch(&self, step: &Step) {
        increment_counter!(STEP_DISPATCHES, "type" => step.step_type.as_str());
    }

    fn on_webhook_rejected(&self, _reason: &str) {
        increment_counter!(WEBHOOKS_REJECTED);
    }
}
