//! Step invocation over HTTP
//!
//! [`StepClient`] is the seam between the engine and remote steps. The
//! engine only ever talks to steps through it, so tests substitute a mock
//! and production uses [`HttpStepClient`].

use crate::{Args, CoreError, FlowId, StepId, Token};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Metadata sent with every invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub token: Token,
    /// Callback address for async steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Engine → step request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub arguments: Args,
    pub metadata: RequestMetadata,
}

/// Step → engine result body, also accepted by the webhook route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Failure that must not be retried
    #[serde(default)]
    pub is_terminal_stop: bool,
}

impl StepResult {
    pub fn success(outputs: Args) -> Self {
        Self {
            success: true,
            outputs: Some(outputs),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exception: Some(message.into()),
            ..Self::default()
        }
    }

    /// Interpret the result as a work outcome
    pub fn into_outcome(self) -> WorkOutcome {
        if self.success {
            return WorkOutcome::Completed(self.outputs.unwrap_or_default());
        }
        if let Some(message) = self.exception {
            return WorkOutcome::Exception(message);
        }
        WorkOutcome::Failed {
            error: self
                .error
                .unwrap_or_else(|| "step reported failure without an error".to_string()),
            retryable: !self.is_terminal_stop,
        }
    }
}

/// What happened to one dispatched work item
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// Raw outputs, before output mapping
    Completed(Args),
    /// Business, transport or timeout failure
    Failed { error: String, retryable: bool },
    /// Unrecoverable; fails the flow
    Exception(String),
    /// Result will arrive through the webhook
    Pending,
}

impl From<CoreError> for WorkOutcome {
    fn from(err: CoreError) -> Self {
        WorkOutcome::Failed {
            error: err.to_string(),
            retryable: matches!(err, CoreError::Transport(_) | CoreError::Timeout(_)),
        }
    }
}

/// Invokes remote steps
#[async_trait]
pub trait StepClient: Send + Sync {
    /// Call a sync step and wait for its result
    async fn invoke(
        &self,
        endpoint: &str,
        timeout: Duration,
        request: &StepRequest,
    ) -> Result<StepResult, CoreError>;

    /// Hand work to an async step; the result arrives via webhook
    async fn dispatch_async(
        &self,
        endpoint: &str,
        timeout: Duration,
        request: &StepRequest,
    ) -> Result<(), CoreError>;

    /// GET a step's health-check URL; any status below 400 is healthy
    async fn check_health(&self, url: &str, timeout: Duration) -> Result<(), CoreError>;
}

/// `reqwest` backed client
#[derive(Debug, Clone, Default)]
pub struct HttpStepClient {
    client: Client,
}

impl HttpStepClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn map_http_error(endpoint: &str, error: reqwest::Error) -> CoreError {
        if error.is_timeout() {
            CoreError::Timeout(format!("{}: {}", endpoint, error))
        } else if error.is_connect() {
            CoreError::Transport(format!("connection to {} failed: {}", endpoint, error))
        } else {
            CoreError::Transport(format!("request to {} failed: {}", endpoint, error))
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        timeout: Duration,
        request: &StepRequest,
    ) -> Result<reqwest::Response, CoreError> {
        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::map_http_error(endpoint, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CoreError::Transport(format!(
            "{} returned {}: {}",
            endpoint, status, body
        )))
    }
}

#[async_trait]
impl StepClient for HttpStepClient {
    #[instrument(skip(self, request), fields(step_id = %request.metadata.step_id))]
    async fn invoke(
        &self,
        endpoint: &str,
        timeout: Duration,
        request: &StepRequest,
    ) -> Result<StepResult, CoreError> {
        let response = self.post(endpoint, timeout, request).await?;
        let result = response
            .json::<StepResult>()
            .await
            .map_err(|e| CoreError::Transport(format!("invalid step response: {}", e)))?;
        debug!(success = result.success, "Step responded");
        Ok(result)
    }

    #[instrument(skip(self, request), fields(step_id = %request.metadata.step_id))]
    async fn dispatch_async(
        &self,
        endpoint: &str,
        timeout: Duration,
        request: &StepRequest,
    ) -> Result<(), CoreError> {
        self.post(endpoint, timeout, request).await?;
        debug!("Async step accepted work");
        Ok(())
    }

    async fn check_health(&self, url: &str, timeout: Duration) -> Result<(), CoreError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_http_error(url, e))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(CoreError::Transport(format!("HTTP {}", status)));
        }
        Ok(())
    }
}
