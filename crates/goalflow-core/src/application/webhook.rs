//! Results delivered for async steps
//!
//! The webhook path funnels into the same outcome handling as in-process
//! results. A panic while applying a result fails the work item with a
//! retryable error instead of taking the caller down.

use crate::application::dispatch::StepResult;
use crate::application::engine::{panic_message, Engine, PANIC_MARKER};
use crate::{CoreError, FlowId, StepId, Token};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};

impl Engine {
    /// Apply a step result posted to `/webhook/{flow}/{step}/{token}`
    ///
    /// Results for unknown flows, finished steps or superseded tokens are
    /// rejected and leave the flow untouched.
    pub async fn handle_step_result(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        token: &Token,
        result: StepResult,
    ) -> Result<(), CoreError> {
        info!(flow_id = %flow_id, step_id = %step_id, success = result.success, "Webhook result received");
        let outcome = result.into_outcome();

        let applied = AssertUnwindSafe(self.apply_outcome(flow_id, step_id, token, outcome))
            .catch_unwind()
            .await;

        match applied {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if e.is_stale() {
                    debug!(flow_id = %flow_id, step_id = %step_id, token = %token, error = %e, "Rejected stale webhook result");
                } else {
                    warn!(flow_id = %flow_id, step_id = %step_id, error = %e, "Rejected webhook result");
                }
                if let Some(observer) = self.observer() {
                    observer.on_webhook_rejected(&e.to_string());
                }
                Err(e)
            }
            Err(panic) => {
                let message = format!("{} {}", PANIC_MARKER, panic_message(panic.as_ref()));
                error!(flow_id = %flow_id, step_id = %step_id, error = %message, "Webhook handling panicked");
                self.fail_work(flow_id, step_id, token, &message, true).await
            }
        }
    }
}
