use crate::domain::step::{BackoffType, Step};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and backoff policy applied to failed work items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for any delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub backoff_type: BackoffType,
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_type: BackoffType::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Policy with the step's work config overrides applied field by field
    pub fn for_step(&self, step: &Step) -> RetryPolicy {
        let Some(work) = &step.work_config else {
            return *self;
        };
        RetryPolicy {
            max_retries: work.max_retries.unwrap_or(self.max_retries),
            backoff_ms: work.backoff_ms.unwrap_or(self.backoff_ms),
            max_backoff_ms: work.max_backoff_ms.unwrap_or(self.max_backoff_ms),
            backoff_type: work.backoff_type.unwrap_or(self.backoff_type),
        }
    }

    /// Whether an item that has already been retried `retry_count` times may retry again
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry_count + 1`
    pub fn delay(&self, retry_count: u32) -> Duration {
        let raw = match self.backoff_type {
            BackoffType::Fixed => self.backoff_ms,
            BackoffType::Linear => self
                .backoff_ms
                .saturating_mul(u64::from(retry_count).saturating_add(1)),
            BackoffType::Exponential => {
                let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
                self.backoff_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(raw.min(self.max_backoff_ms))
    }
}
