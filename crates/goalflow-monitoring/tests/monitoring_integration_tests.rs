use goalflow_core::{
    Args, AttributeRole, AttributeSpec, AttributeType, Engine, EngineConfig, FlowId, FlowStatus,
    Step, StepId, StepType,
};
use goalflow_monitoring::{init_metrics, EngineMetrics, MonitoringConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_engine_runs_with_metrics_observer() {
    init_metrics(&MonitoringConfig::default()).unwrap();

    let engine = Engine::builder(EngineConfig::default())
        .observer(Arc::new(EngineMetrics::new()))
        .build();
    engine
        .catalog()
        .register(
            Step::new("echo", StepType::Script)
                .with_script("jmespath", "{copy: value}")
                .with_attribute("value", AttributeSpec::new(AttributeRole::Required, AttributeType::Any))
                .with_attribute("copy", AttributeSpec::new(AttributeRole::Output, AttributeType::Any)),
        )
        .unwrap();

    let mut init = Args::new();
    init.insert("value".to_string(), serde_json::json!([1, 2]));
    let id = FlowId::from("metered");
    engine
        .start_flow(id.clone(), &[StepId::from("echo")], init)
        .await
        .unwrap();

    let flow = engine.wait_for_flow(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(flow.status, FlowStatus::Completed);
    assert_eq!(flow.state["copy"], serde_json::json!([1, 2]));
}
