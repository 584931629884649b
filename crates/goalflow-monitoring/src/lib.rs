//! Logging and metrics for Goalflow
//!
//! [`init_logging`] installs the process-wide tracing subscriber and
//! [`EngineMetrics`] turns engine callbacks into `metrics` counters and
//! histograms. Exporting is optional and lives behind the `prometheus`
//! feature.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub mod logging;
pub mod metrics;

pub use crate::logging::init_logging;
pub use crate::metrics::{init_metrics, EngineMetrics};

/// Configuration for logging and metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Log filter directive (e.g. "info,goalflow_core=debug"); `RUST_LOG` wins
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Address for the Prometheus scrape endpoint; metrics are only
    /// recorded in-process when unset
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

fn default_service_name() -> String {
    "goalflow".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            json: false,
            metrics_addr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "goalflow");
        assert_eq!(config.log_filter, "info");
        assert!(!config.json);
        assert!(config.metrics_addr.is_none());
    }
}
