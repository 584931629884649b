//! Flow aggregate
//!
//! [`FlowContext`] owns the mutable state of one flow run. Every mutation
//! goes through the transition methods below, which guard on flow status,
//! execution status and the current dispatch token. After each transition
//! the context re-evaluates reachability and terminal conditions.
//!
//! Every dispatch unit is a [`WorkItemState`]. A plain step has exactly one
//! item; a for-each step has one per element of the cartesian product of
//! its for-each inputs.

use crate::domain::events::FlowEvent;
use crate::domain::plan::ExecutionPlan;
use crate::domain::retry::RetryPolicy;
use crate::domain::step::Step;
use crate::domain::work::aggregate_outputs;
use crate::{Args, CoreError, FlowId, StepId, Token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Active)
    }
}

/// Status of an execution or a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
        )
    }
}

/// Why and where a flow failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorState {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
}

/// One independently tracked dispatch unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemState {
    /// Current token; replaced on every retry
    pub token: Token,
    /// Position in the fan-out, used to order aggregated outputs
    pub index: usize,
    pub status: ExecutionStatus,
    pub inputs: Args,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-flow record of one step's run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub step_id: StepId,
    pub flow_id: FlowId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub inputs: Args,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Retries across all work items
    pub retry_count: u32,
    /// Work items keyed by their current token
    #[serde(default)]
    pub work_items: BTreeMap<Token, WorkItemState>,
}

impl ExecutionState {
    fn pending(step_id: StepId, flow_id: FlowId) -> Self {
        Self {
            step_id,
            flow_id,
            status: ExecutionStatus::Pending,
            inputs: Args::new(),
            outputs: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            work_items: BTreeMap::new(),
        }
    }

    /// Work items ordered by fan-out index
    pub fn items_by_index(&self) -> Vec<&WorkItemState> {
        let mut items: Vec<&WorkItemState> = self.work_items.values().collect();
        items.sort_by_key(|item| item.index);
        items
    }

    fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds());
    }
}

/// Link from a nested flow back to the parent work item it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub token: Token,
}

/// Outcome of a failure report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Item rescheduled under a new token
    Retrying {
        token: Token,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted or failure not retryable
    Failed,
}

/// Short view of a flow for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDigest {
    pub id: FlowId,
    pub status: FlowStatus,
    pub goals: Vec<StepId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_state: Option<ErrorState>,
}

/// Aggregate: one running flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowContext {
    pub id: FlowId,
    pub status: FlowStatus,
    /// Resolved attribute values
    pub state: Args,
    pub plan: ExecutionPlan,
    pub executions: BTreeMap<StepId, ExecutionState>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_state: Option<ErrorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    /// Nesting depth, zero for top-level flows
    #[serde(default)]
    pub depth: u32,
    #[serde(skip)]
    events: Vec<FlowEvent>,
}

impl PartialEq for FlowContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.status == other.status
            && self.state == other.state
            && self.plan == other.plan
            && self.executions == other.executions
            && self.started_at == other.started_at
            && self.completed_at == other.completed_at
            && self.error_state == other.error_state
            && self.parent == other.parent
            && self.depth == other.depth
    }
}

impl FlowContext {
    /// Start a flow from a plan and initial state
    pub fn start(id: FlowId, plan: ExecutionPlan, init: Args) -> Result<Self, CoreError> {
        Self::start_nested(id, plan, init, None, 0)
    }

    /// Start a flow that serves a parent work item
    pub fn start_nested(
        id: FlowId,
        plan: ExecutionPlan,
        init: Args,
        parent: Option<ParentRef>,
        depth: u32,
    ) -> Result<Self, CoreError> {
        let mut state = init;
        for (name, default) in plan.external_defaults() {
            state.entry(name.clone()).or_insert_with(|| default.clone());
        }
        plan.validate_inputs(&state)?;

        let executions = plan
            .steps
            .keys()
            .map(|step_id| {
                (
                    step_id.clone(),
                    ExecutionState::pending(step_id.clone(), id.clone()),
                )
            })
            .collect();

        let now = Utc::now();
        let mut flow = Self {
            id: id.clone(),
            status: FlowStatus::Active,
            state,
            plan,
            executions,
            started_at: now,
            completed_at: None,
            error_state: None,
            parent,
            depth,
            events: Vec::with_capacity(8),
        };

        info!(flow_id = %id, goals = ?flow.plan.goals, depth, "Flow started");
        flow.record(FlowEvent::FlowStarted {
            flow_id: id,
            timestamp: now,
        });
        flow.evaluate();
        Ok(flow)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn execution(&self, step_id: &StepId) -> Option<&ExecutionState> {
        self.executions.get(step_id)
    }

    pub fn digest(&self) -> FlowDigest {
        FlowDigest {
            id: self.id.clone(),
            status: self.status,
            goals: self.plan.goals.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_state: self.error_state.clone(),
        }
    }

    /// Drain recorded events
    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Pending steps whose inputs are resolved
    pub fn ready_steps(&self) -> Vec<StepId> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .filter_map(|e| self.plan.step(&e.step_id))
            .filter(|step| self.is_ready(step))
            .map(|step| step.id.clone())
            .collect()
    }

    fn is_ready(&self, step: &Step) -> bool {
        step.required_inputs()
            .all(|name| self.state.contains_key(name))
            && step
                .optional_inputs()
                .all(|name| self.state.contains_key(name) || !self.awaiting_provider(&step.id, name))
    }

    /// An optional input waits while an upstream provider may still produce it
    fn awaiting_provider(&self, consumer: &StepId, name: &str) -> bool {
        self.plan.providers_of(name).iter().any(|provider| {
            provider != consumer
                && !self.plan.depends_on(provider, consumer)
                && self
                    .executions
                    .get(provider)
                    .map_or(false, |e| !e.status.is_terminal())
        })
    }

    /// Values passed to a step: state for inputs, literals for consts
    pub fn collect_inputs(&self, step: &Step) -> Args {
        let mut inputs = Args::new();
        for (name, spec) in &step.attributes {
            if spec.is_output() {
                continue;
            }
            let value = if spec.is_const() {
                spec.default_or_zero()
            } else if let Some(value) = self.state.get(name) {
                value.clone()
            } else if spec.is_optional() {
                spec.default_or_zero()
            } else {
                continue;
            };
            inputs.insert(name.clone(), value);
        }
        inputs
    }

    /// pending → active, creating one work item per argument set
    pub fn step_started(
        &mut self,
        step_id: &StepId,
        inputs: Args,
        items: Vec<Args>,
    ) -> Result<Vec<Token>, CoreError> {
        self.ensure_active()?;
        let now = Utc::now();
        let exec = self
            .executions
            .get_mut(step_id)
            .ok_or_else(|| CoreError::ExecutionNotFound(step_id.0.clone()))?;
        if exec.status != ExecutionStatus::Pending {
            return Err(CoreError::Other(format!(
                "cannot start step {} in status {:?}",
                step_id, exec.status
            )));
        }

        exec.status = ExecutionStatus::Active;
        exec.started_at.get_or_insert(now);
        exec.inputs = inputs;

        let mut tokens = Vec::with_capacity(items.len());
        for (index, item_inputs) in items.into_iter().enumerate() {
            let token = Token::generate();
            exec.work_items.insert(
                token.clone(),
                WorkItemState {
                    token: token.clone(),
                    index,
                    status: ExecutionStatus::Pending,
                    inputs: item_inputs,
                    outputs: None,
                    error: None,
                    retry_count: 0,
                    next_retry_at: None,
                    started_at: None,
                    completed_at: None,
                },
            );
            tokens.push(token);
        }

        debug!(flow_id = %self.id, step_id = %step_id, work_items = tokens.len(), "Step started");
        self.record(FlowEvent::StepStarted {
            flow_id: self.id.clone(),
            step_id: step_id.clone(),
            work_items: tokens.len(),
            timestamp: now,
        });

        if tokens.is_empty() {
            self.complete_execution(step_id, now);
            self.evaluate();
        }
        Ok(tokens)
    }

    /// Work item pending → active; returns the item's arguments
    pub fn step_dispatched(&mut self, step_id: &StepId, token: &Token) -> Result<Args, CoreError> {
        self.ensure_active()?;
        let exec = self.active_execution_mut(step_id)?;
        let item = exec
            .work_items
            .get_mut(token)
            .ok_or_else(|| CoreError::StaleToken(token.0.clone()))?;
        if item.status != ExecutionStatus::Pending {
            return Err(CoreError::StaleToken(token.0.clone()));
        }
        item.status = ExecutionStatus::Active;
        item.next_retry_at = None;
        item.started_at = Some(Utc::now());
        Ok(item.inputs.clone())
    }

    /// Apply outputs reported for the current token
    pub fn step_completed(
        &mut self,
        step_id: &StepId,
        token: &Token,
        outputs: Args,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        let now = Utc::now();
        let exec = self.active_execution_mut(step_id)?;
        let item = current_item(exec, token)?;
        item.status = ExecutionStatus::Completed;
        item.outputs = Some(outputs);
        item.error = None;
        item.completed_at = Some(now);

        let all_done = exec
            .work_items
            .values()
            .all(|i| i.status == ExecutionStatus::Completed);
        if all_done {
            self.complete_execution(step_id, now);
            self.evaluate();
        }
        Ok(())
    }

    fn complete_execution(&mut self, step_id: &StepId, now: DateTime<Utc>) {
        let Some(step) = self.plan.steps.get(step_id) else {
            return;
        };
        let Some(exec) = self.executions.get_mut(step_id) else {
            return;
        };

        let items = exec.items_by_index();
        let ordered: Vec<Option<&Args>> = items.iter().map(|i| i.outputs.as_ref()).collect();
        let outputs = aggregate_outputs(step, &ordered);

        exec.finish(ExecutionStatus::Completed, now);
        exec.outputs = Some(outputs.clone());
        exec.error_message = None;
        let duration_ms = exec.duration_ms;

        for (name, value) in outputs {
            self.state.insert(name, value);
        }

        debug!(flow_id = %self.id, step_id = %step_id, ?duration_ms, "Step completed");
        self.record(FlowEvent::StepCompleted {
            flow_id: self.id.clone(),
            step_id: step_id.clone(),
            duration_ms,
            timestamp: now,
        });
    }

    /// Record a failure for the current token, retrying while budget remains
    pub fn step_failed(
        &mut self,
        step_id: &StepId,
        token: &Token,
        error: &str,
        policy: &RetryPolicy,
        retryable: bool,
    ) -> Result<FailureOutcome, CoreError> {
        self.ensure_active()?;
        let now = Utc::now();
        let flow_id = self.id.clone();
        let exec = self.active_execution_mut(step_id)?;
        let item = current_item(exec, token)?;

        if retryable && policy.can_retry(item.retry_count) {
            let delay = policy.delay(item.retry_count);
            let next_retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let new_token = Token::generate();

            let mut item = match exec.work_items.remove(token) {
                Some(item) => item,
                None => return Err(CoreError::StaleToken(token.0.clone())),
            };
            item.retry_count += 1;
            item.status = ExecutionStatus::Pending;
            item.error = Some(error.to_string());
            item.next_retry_at = Some(next_retry_at);
            item.token = new_token.clone();
            let retry_count = item.retry_count;
            exec.work_items.insert(new_token.clone(), item);
            exec.retry_count += 1;
            exec.error_message = Some(error.to_string());

            warn!(
                flow_id = %flow_id,
                step_id = %step_id,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error,
                "Step failed, retry scheduled"
            );
            self.record(FlowEvent::RetryScheduled {
                flow_id,
                step_id: step_id.clone(),
                token: new_token.clone(),
                retry_count,
                delay_ms: delay.as_millis() as u64,
                timestamp: now,
            });
            return Ok(FailureOutcome::Retrying {
                token: new_token,
                next_retry_at,
            });
        }

        item.status = ExecutionStatus::Failed;
        item.error = Some(error.to_string());
        item.completed_at = Some(now);
        self.fail_execution(step_id, error, now);
        self.evaluate();
        Ok(FailureOutcome::Failed)
    }

    /// Unrecoverable failure reported by a step: fails the flow without retry
    pub fn step_exception(
        &mut self,
        step_id: &StepId,
        token: &Token,
        message: &str,
    ) -> Result<(), CoreError> {
        self.ensure_active()?;
        let now = Utc::now();
        let exec = self.active_execution_mut(step_id)?;
        let item = current_item(exec, token)?;
        item.status = ExecutionStatus::Failed;
        item.error = Some(message.to_string());
        item.completed_at = Some(now);

        self.fail_execution(step_id, message, now);
        self.fail(Some(step_id.clone()), message.to_string(), now);
        Ok(())
    }

    fn fail_execution(&mut self, step_id: &StepId, error: &str, now: DateTime<Utc>) {
        let Some(exec) = self.executions.get_mut(step_id) else {
            return;
        };
        exec.finish(ExecutionStatus::Failed, now);
        exec.error_message = Some(error.to_string());
        for item in exec.work_items.values_mut() {
            if !item.status.is_terminal() {
                item.status = ExecutionStatus::Skipped;
            }
        }

        warn!(flow_id = %self.id, step_id = %step_id, error, "Step failed permanently");
        self.record(FlowEvent::StepFailed {
            flow_id: self.id.clone(),
            step_id: step_id.clone(),
            error: error.to_string(),
            timestamp: now,
        });
    }

    /// pending → skipped
    pub fn step_skipped(&mut self, step_id: &StepId, reason: &str) -> Result<(), CoreError> {
        self.ensure_active()?;
        let status = self
            .executions
            .get(step_id)
            .map(|e| e.status)
            .ok_or_else(|| CoreError::ExecutionNotFound(step_id.0.clone()))?;
        if status != ExecutionStatus::Pending {
            return Err(CoreError::Other(format!(
                "cannot skip step {} in status {:?}",
                step_id, status
            )));
        }
        self.skip(step_id, reason, Utc::now());
        self.evaluate();
        Ok(())
    }

    fn skip(&mut self, step_id: &StepId, reason: &str, now: DateTime<Utc>) {
        if let Some(exec) = self.executions.get_mut(step_id) {
            exec.status = ExecutionStatus::Skipped;
            exec.error_message = Some(reason.to_string());
            exec.completed_at = Some(now);
        }
        debug!(flow_id = %self.id, step_id = %step_id, reason, "Step skipped");
        self.record(FlowEvent::StepSkipped {
            flow_id: self.id.clone(),
            step_id: step_id.clone(),
            reason: reason.to_string(),
            timestamp: now,
        });
    }

    /// Operator cancellation
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        self.ensure_active()?;
        self.fail(None, "flow cancelled".to_string(), Utc::now());
        Ok(())
    }

    /// Work items ready to dispatch: pending, backoff elapsed, within the
    /// step's parallelism limit
    pub fn due_work(&self, now: DateTime<Utc>) -> Vec<(StepId, Token)> {
        if self.is_terminal() {
            return Vec::new();
        }

        let mut due = Vec::new();
        for exec in self.executions.values() {
            if exec.status != ExecutionStatus::Active {
                continue;
            }
            let limit = self
                .plan
                .step(&exec.step_id)
                .and_then(|s| s.work_config.as_ref())
                .and_then(|w| w.parallelism)
                .filter(|p| *p > 0)
                .unwrap_or(usize::MAX);

            let items = exec.items_by_index();
            let active = items
                .iter()
                .filter(|i| i.status == ExecutionStatus::Active)
                .count();
            let mut slots = limit.saturating_sub(active);

            for item in items {
                if slots == 0 {
                    break;
                }
                if item.status != ExecutionStatus::Pending {
                    continue;
                }
                if item.next_retry_at.map_or(true, |at| at <= now) {
                    due.push((exec.step_id.clone(), item.token.clone()));
                    slots -= 1;
                }
            }
        }
        due
    }

    /// Earliest scheduled retry across the flow
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Active)
            .flat_map(|e| e.work_items.values())
            .filter(|i| i.status == ExecutionStatus::Pending)
            .filter_map(|i| i.next_retry_at)
            .min()
    }

    /// After recovery from a snapshot: in-flight items are reissued under new tokens
    pub fn rearm(&mut self) -> usize {
        let mut rearmed = 0;
        for exec in self.executions.values_mut() {
            if exec.status != ExecutionStatus::Active {
                continue;
            }
            let stale: Vec<Token> = exec
                .work_items
                .values()
                .filter(|i| i.status == ExecutionStatus::Active)
                .map(|i| i.token.clone())
                .collect();
            for token in stale {
                if let Some(mut item) = exec.work_items.remove(&token) {
                    let new_token = Token::generate();
                    item.token = new_token.clone();
                    item.status = ExecutionStatus::Pending;
                    item.next_retry_at = None;
                    exec.work_items.insert(new_token, item);
                    rearmed += 1;
                }
            }
        }
        rearmed
    }

    /// Skip unreachable and unneeded steps, then settle the flow status
    pub fn evaluate(&mut self) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();

        loop {
            let unreachable: Vec<StepId> = self
                .pending_steps()
                .into_iter()
                .filter(|id| !self.can_complete(id, &mut BTreeSet::new()))
                .collect();
            for id in &unreachable {
                self.skip(id, "required inputs can no longer be satisfied", now);
            }

            let unused: Vec<StepId> = self
                .pending_steps()
                .into_iter()
                .filter(|id| !self.plan.is_goal(id) && !self.outputs_needed(id))
                .collect();
            for id in &unused {
                self.skip(id, "outputs no longer needed", now);
            }

            if unreachable.is_empty() && unused.is_empty() {
                break;
            }
        }

        self.check_terminal(now);
    }

    fn pending_steps(&self) -> Vec<StepId> {
        self.executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .map(|e| e.step_id.clone())
            .collect()
    }

    /// Whether a step has completed or still could
    pub fn can_complete(&self, id: &StepId, visiting: &mut BTreeSet<StepId>) -> bool {
        let Some(exec) = self.executions.get(id) else {
            return false;
        };
        match exec.status {
            ExecutionStatus::Completed => return true,
            ExecutionStatus::Failed | ExecutionStatus::Skipped => return false,
            ExecutionStatus::Pending | ExecutionStatus::Active => {}
        }
        let Some(step) = self.plan.step(id) else {
            return false;
        };
        if !visiting.insert(id.clone()) {
            return false;
        }

        let possible = step.required_inputs().all(|name| {
            self.state.contains_key(name)
                || self
                    .plan
                    .providers_of(name)
                    .iter()
                    .any(|p| p != id && self.can_complete(p, visiting))
        });
        visiting.remove(id);
        possible
    }

    fn outputs_needed(&self, id: &StepId) -> bool {
        let Some(step) = self.plan.step(id) else {
            return false;
        };
        step.outputs().any(|name| {
            !self.state.contains_key(name)
                && self.plan.consumers_of(name).iter().any(|consumer| {
                    self.executions
                        .get(consumer)
                        .map_or(false, |e| e.status == ExecutionStatus::Pending)
                })
        })
    }

    fn check_terminal(&mut self, now: DateTime<Utc>) {
        let goals_done = self.plan.goals.iter().all(|goal| {
            self.executions
                .get(goal)
                .map_or(true, |e| e.status == ExecutionStatus::Completed)
        });
        if goals_done {
            self.complete(now);
            return;
        }

        let lost_goal = self
            .plan
            .goals
            .iter()
            .find(|goal| {
                self.executions.get(*goal).map_or(false, |e| {
                    matches!(e.status, ExecutionStatus::Failed | ExecutionStatus::Skipped)
                })
            })
            .cloned();

        if let Some(goal) = lost_goal {
            let root = self.root_failure(&goal, &mut BTreeSet::new()).unwrap_or(goal);
            let message = self
                .executions
                .get(&root)
                .and_then(|e| e.error_message.clone())
                .unwrap_or_else(|| format!("step {} can no longer complete", root));
            self.fail(Some(root), message, now);
        }
    }

    fn root_failure(&self, id: &StepId, seen: &mut BTreeSet<StepId>) -> Option<StepId> {
        if !seen.insert(id.clone()) {
            return None;
        }
        let exec = self.executions.get(id)?;
        match exec.status {
            ExecutionStatus::Failed => Some(id.clone()),
            ExecutionStatus::Skipped => {
                let step = self.plan.step(id)?;
                for name in step.required_inputs() {
                    if self.state.contains_key(name) {
                        continue;
                    }
                    for provider in self.plan.providers_of(name) {
                        if let Some(root) = self.root_failure(provider, seen) {
                            return Some(root);
                        }
                    }
                }
                Some(id.clone())
            }
            _ => None,
        }
    }

    fn complete(&mut self, now: DateTime<Utc>) {
        self.status = FlowStatus::Completed;
        self.completed_at = Some(now);
        for id in self.pending_steps() {
            self.skip(&id, "flow completed", now);
        }
        info!(flow_id = %self.id, "Flow completed");
        self.record(FlowEvent::FlowCompleted {
            flow_id: self.id.clone(),
            timestamp: now,
        });
    }

    fn fail(&mut self, step_id: Option<StepId>, message: String, now: DateTime<Utc>) {
        for id in self.pending_steps() {
            self.skip(&id, "flow failed", now);
        }
        self.status = FlowStatus::Failed;
        self.completed_at = Some(now);
        self.error_state = Some(ErrorState {
            message: message.clone(),
            step_id: step_id.clone(),
            timestamp: now,
        });
        warn!(flow_id = %self.id, step_id = ?step_id, error = %message, "Flow failed");
        self.record(FlowEvent::FlowFailed {
            flow_id: self.id.clone(),
            step_id,
            error: message,
            timestamp: now,
        });
    }

    fn ensure_active(&self) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::FlowTerminal(self.id.0.clone()));
        }
        Ok(())
    }

    fn active_execution_mut(&mut self, step_id: &StepId) -> Result<&mut ExecutionState, CoreError> {
        let exec = self
            .executions
            .get_mut(step_id)
            .ok_or_else(|| CoreError::ExecutionNotFound(step_id.0.clone()))?;
        if exec.status != ExecutionStatus::Active {
            return Err(CoreError::StaleToken(format!(
                "step {} is {:?}",
                step_id, exec.status
            )));
        }
        Ok(exec)
    }
}

/// The active work item addressed by `token`
fn current_item<'a>(
    exec: &'a mut ExecutionState,
    token: &Token,
) -> Result<&'a mut WorkItemState, CoreError> {
    match exec.work_items.get_mut(token) {
        Some(item) if item.status == ExecutionStatus::Active => Ok(item),
        _ => Err(CoreError::StaleToken(token.0.clone())),
    }
}
