use crate::domain::retry::RetryPolicy;
use crate::domain::work::MAX_WORK_ITEMS;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy applied unless a step overrides it
    #[serde(default)]
    pub retry: RetryPolicy,

    /// How often the retry loop scans for due work
    #[serde(default = "default_retry_check_interval_ms")]
    pub retry_check_interval_ms: u64,

    /// Timeout for HTTP steps that do not declare one
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Base URL async steps call back on, without the `/webhook` suffix
    #[serde(default = "default_webhook_base_url")]
    pub webhook_base_url: String,

    /// Deepest allowed sub-flow nesting
    #[serde(default = "default_max_subflow_depth")]
    pub max_subflow_depth: u32,

    /// Entries kept by the memoization cache; zero disables it
    #[serde(default = "default_memo_cache_size")]
    pub memo_cache_size: usize,

    /// Upper bound on work items per step execution
    #[serde(default = "default_max_work_items")]
    pub max_work_items: usize,

    /// Snapshot key prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How often HTTP steps with a health-check URL are checked
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// A step that completed work this recently counts as healthy without
    /// being checked
    #[serde(default = "default_health_success_window_ms")]
    pub health_success_window_ms: u64,
}

fn default_retry_check_interval_ms() -> u64 {
    1000
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_webhook_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_subflow_depth() -> u32 {
    8
}

fn default_memo_cache_size() -> usize {
    10_240
}

fn default_max_work_items() -> usize {
    MAX_WORK_ITEMS
}

fn default_namespace() -> String {
    "goalflow".to_string()
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    3_000
}

fn default_health_success_window_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_check_interval_ms: default_retry_check_interval_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            webhook_base_url: default_webhook_base_url(),
            max_subflow_depth: default_max_subflow_depth(),
            memo_cache_size: default_memo_cache_size(),
            max_work_items: default_max_work_items(),
            namespace: default_namespace(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            health_success_window_ms: default_health_success_window_ms(),
        }
    }
}

impl EngineConfig {
    pub fn retry_check_interval(&self) -> Duration {
        Duration::from_millis(self.retry_check_interval_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn health_success_window(&self) -> Duration {
        Duration::from_millis(self.health_success_window_ms)
    }

    /// Callback URL for one dispatch attempt
    pub fn webhook_url(&self, flow_id: &str, step_id: &str, token: &str) -> String {
        format!(
            "{}/webhook/{}/{}/{}",
            self.webhook_base_url.trim_end_matches('/'),
            flow_id,
            step_id,
            token
        )
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.retry.max_backoff_ms < self.retry.backoff_ms {
            return Err(CoreError::Configuration(format!(
                "max_backoff_ms ({}) must not be less than backoff_ms ({})",
                self.retry.max_backoff_ms, self.retry.backoff_ms
            )));
        }
        if self.step_timeout_ms == 0 {
            return Err(CoreError::Configuration(
                "step_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_check_interval_ms == 0 {
            return Err(CoreError::Configuration(
                "retry_check_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_work_items == 0 {
            return Err(CoreError::Configuration(
                "max_work_items must be greater than zero".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 || self.health_check_timeout_ms == 0 {
            return Err(CoreError::Configuration(
                "health check interval and timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
