//! Flow engine
//!
//! The engine owns the step catalog and the table of running flows. Each
//! flow sits behind its own async mutex; every transition happens under
//! that lock, after which the engine releases it, publishes the recorded
//! events, saves a snapshot and spawns the work that became due.
//!
//! Work runs on spawned tasks. Its outcome re-enters the flow through
//! [`Engine::complete_work`], [`Engine::fail_work`] or
//! [`Engine::exception_work`], which is also how webhook results arrive.

use crate::application::config::EngineConfig;
use crate::application::dispatch::{
    HttpStepClient, RequestMetadata, StepClient, StepRequest, WorkOutcome,
};
use crate::application::mapping;
use crate::application::memo::MemoCache;
use crate::application::observer::EngineObserver;
use crate::application::script;
use crate::domain::catalog::StepCatalog;
use crate::domain::events::FlowEvent;
use crate::domain::flow::{ErrorState, FailureOutcome, FlowContext, FlowDigest, FlowStatus, ParentRef};
use crate::domain::health::HealthState;
use crate::domain::plan::{create_plan, ExecutionPlan};
use crate::domain::repository::{NullSnapshotStore, SnapshotKey, SnapshotStore};
use crate::domain::retry::RetryPolicy;
use crate::domain::step::{Step, StepType};
use crate::domain::work::expand_work_items;
use crate::{Args, CoreError, FlowId, StepId, Token};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Marker prefix for failures caused by a panicking step handler
pub const PANIC_MARKER: &str = "step handler panicked:";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One running flow
struct FlowEntry {
    context: Mutex<FlowContext>,
    status: watch::Sender<FlowStatus>,
    /// Bumped under the context lock for every snapshot taken
    version: AtomicU64,
    /// Version of the last snapshot handed to the store
    saved: Mutex<u64>,
}

impl FlowEntry {
    fn new(flow: FlowContext) -> Self {
        let (status, _) = watch::channel(flow.status);
        Self {
            context: Mutex::new(flow),
            status,
            version: AtomicU64::new(0),
            saved: Mutex::new(0),
        }
    }
}

/// A work item ready to run outside the flow lock
struct Job {
    flow_id: FlowId,
    step: Step,
    token: Token,
    inputs: Args,
    depth: u32,
}

/// A finished nested flow reporting back to its parent
struct ChildResult {
    parent: ParentRef,
    status: FlowStatus,
    state: Args,
    error: Option<ErrorState>,
}

struct EngineInner {
    config: EngineConfig,
    catalog: StepCatalog,
    flows: DashMap<FlowId, Arc<FlowEntry>>,
    client: Arc<dyn StepClient>,
    store: Arc<dyn SnapshotStore>,
    observer: Option<Arc<dyn EngineObserver>>,
    memo: MemoCache,
    events: broadcast::Sender<FlowEvent>,
    health: DashMap<StepId, HealthState>,
    last_success: DashMap<StepId, Instant>,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    catalog: StepCatalog,
    client: Option<Arc<dyn StepClient>>,
    store: Option<Arc<dyn SnapshotStore>>,
    observer: Option<Arc<dyn EngineObserver>>,
}

impl EngineBuilder {
    pub fn catalog(mut self, catalog: StepCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn client(mut self, client: Arc<dyn StepClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Engine {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Engine {
            inner: Arc::new(EngineInner {
                memo: MemoCache::new(self.config.memo_cache_size),
                config: self.config,
                catalog: self.catalog,
                flows: DashMap::new(),
                client: self
                    .client
                    .unwrap_or_else(|| Arc::new(HttpStepClient::new())),
                store: self.store.unwrap_or_else(|| Arc::new(NullSnapshotStore)),
                observer: self.observer,
                events,
                health: DashMap::new(),
                last_success: DashMap::new(),
            }),
        }
    }
}

/// Goal-driven flow engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            catalog: StepCatalog::new(),
            client: None,
            store: None,
            observer: None,
        }
    }

    /// Engine with the default HTTP client and no persistence
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.inner.catalog
    }

    /// Receive lifecycle events of every flow
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    /// Plan without starting a flow
    pub fn plan(&self, goals: &[StepId], init: &Args) -> Result<ExecutionPlan, CoreError> {
        let snapshot = self.inner.catalog.snapshot();
        let available: BTreeSet<String> = init.keys().cloned().collect();
        create_plan(&snapshot, goals, &available)
    }

    /// Plan and start a flow
    pub async fn start_flow(
        &self,
        id: FlowId,
        goals: &[StepId],
        init: Args,
    ) -> Result<FlowContext, CoreError> {
        self.start_nested(id, goals, init, None, 0).await
    }

    async fn start_nested(
        &self,
        id: FlowId,
        goals: &[StepId],
        init: Args,
        parent: Option<ParentRef>,
        depth: u32,
    ) -> Result<FlowContext, CoreError> {
        if self.inner.flows.contains_key(&id) {
            return Err(CoreError::FlowExists(id.0));
        }
        let plan = self.plan(goals, &init)?;
        let flow = FlowContext::start_nested(id.clone(), plan, init, parent, depth)?;

        let entry = Arc::new(FlowEntry::new(flow));
        match self.inner.flows.entry(id.clone()) {
            Entry::Occupied(_) => return Err(CoreError::FlowExists(id.0)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        self.advance(&entry, true).await;
        let flow = entry.context.lock().await.clone();
        Ok(flow)
    }

    /// Snapshot of a flow
    pub async fn get_flow(&self, id: &FlowId) -> Result<FlowContext, CoreError> {
        let entry = self.entry(id)?;
        let flow = entry.context.lock().await.clone();
        Ok(flow)
    }

    /// Digests of all known flows, oldest first
    pub async fn list_flows(&self) -> Vec<FlowDigest> {
        let entries: Vec<Arc<FlowEntry>> =
            self.inner.flows.iter().map(|e| e.value().clone()).collect();
        let mut digests = Vec::with_capacity(entries.len());
        for entry in entries {
            digests.push(entry.context.lock().await.digest());
        }
        digests.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        digests
    }

    /// Fail an active flow and any nested flows it started
    pub async fn cancel_flow(&self, id: &FlowId) -> Result<FlowContext, CoreError> {
        let entry = self.entry(id)?;
        {
            let mut flow = entry.context.lock().await;
            flow.cancel()?;
        }
        info!(flow_id = %id, "Flow cancelled");
        self.advance(&entry, true).await;

        let mut parents = vec![id.clone()];
        while let Some(parent) = parents.pop() {
            for (child_id, child) in self.children_of(&parent).await {
                let cancelled = child.context.lock().await.cancel();
                if cancelled.is_ok() {
                    self.advance(&child, true).await;
                }
                parents.push(child_id);
            }
        }

        let flow = entry.context.lock().await.clone();
        Ok(flow)
    }

    /// Flows whose parent reference points at `id`
    async fn children_of(&self, id: &FlowId) -> Vec<(FlowId, Arc<FlowEntry>)> {
        let entries: Vec<(FlowId, Arc<FlowEntry>)> = self
            .inner
            .flows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut children = Vec::new();
        for (child_id, entry) in entries {
            let is_child = entry
                .context
                .lock()
                .await
                .parent
                .as_ref()
                .is_some_and(|p| &p.flow_id == id);
            if is_child {
                children.push((child_id, entry));
            }
        }
        children
    }

    /// Resolve once the flow is terminal, or fail after `timeout`
    pub async fn wait_for_flow(
        &self,
        id: &FlowId,
        timeout: Duration,
    ) -> Result<FlowContext, CoreError> {
        let entry = self.entry(id)?;
        let mut status = entry.status.subscribe();
        let finished = matches!(
            tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal())).await,
            Ok(Ok(_))
        );
        if !finished {
            return Err(CoreError::Timeout(format!(
                "flow {} still active after {:?}",
                id, timeout
            )));
        }
        let flow = entry.context.lock().await.clone();
        Ok(flow)
    }

    /// Reload a flow from its snapshot and resume it
    pub async fn recover_flow(&self, id: &FlowId) -> Result<FlowContext, CoreError> {
        let key = SnapshotKey::new(&self.inner.config.namespace, id);
        let bytes = self
            .inner
            .store
            .load(&key)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(id.0.clone()))?;
        let mut flow: FlowContext = serde_json::from_slice(&bytes)?;
        let rearmed = flow.rearm();

        let entry = Arc::new(FlowEntry::new(flow));
        match self.inner.flows.entry(id.clone()) {
            Entry::Occupied(_) => return Err(CoreError::FlowExists(id.0.clone())),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        info!(flow_id = %id, rearmed, "Flow recovered from snapshot");

        self.advance(&entry, true).await;
        let flow = entry.context.lock().await.clone();
        Ok(flow)
    }

    /// Drop a terminal flow from memory and from the snapshot store
    pub async fn forget_flow(&self, id: &FlowId) -> Result<(), CoreError> {
        let entry = self.entry(id)?;
        if !entry.context.lock().await.is_terminal() {
            return Err(CoreError::Other(format!("flow {} is still active", id)));
        }
        self.inner.flows.remove(id);
        let key = SnapshotKey::new(&self.inner.config.namespace, id);
        self.inner.store.delete(&key).await
    }

    /// Periodically redispatch work whose backoff has elapsed
    pub fn spawn_retry_loop(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.config.retry_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.retry_due_work().await;
            }
        })
    }

    /// One pass of the retry loop over every active flow
    pub async fn retry_due_work(&self) {
        let entries: Vec<Arc<FlowEntry>> = self
            .inner
            .flows
            .iter()
            .map(|e| e.value().clone())
            .collect();
        trace!(flows = entries.len(), "Retry scan");
        for entry in entries {
            let active = !entry.status.borrow().is_terminal();
            if active {
                self.advance(&entry, false).await;
            }
        }
    }

    /// Apply outputs reported for a work item
    pub async fn complete_work(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        token: &Token,
        raw: Args,
    ) -> Result<(), CoreError> {
        let entry = self.entry(flow_id)?;
        {
            let mut flow = entry.context.lock().await;
            let step = flow
                .plan
                .step(step_id)
                .cloned()
                .ok_or_else(|| CoreError::ExecutionNotFound(step_id.0.clone()))?;
            let item_inputs = flow
                .execution(step_id)
                .and_then(|e| e.work_items.get(token))
                .map(|item| item.inputs.clone());

            match mapping::map_outputs(&step, &raw) {
                Ok(outputs) => {
                    flow.step_completed(step_id, token, outputs)?;
                    if let Some(inputs) = item_inputs {
                        self.inner.memo.put(&step, &inputs, &raw);
                    }
                }
                Err(e) => {
                    flow.step_failed(step_id, token, &e.to_string(), &RetryPolicy::default(), false)?;
                }
            }
        }
        self.advance(&entry, true).await;
        Ok(())
    }

    /// Record a failed work item, scheduling a retry while budget remains
    pub async fn fail_work(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        token: &Token,
        error: &str,
        retryable: bool,
    ) -> Result<(), CoreError> {
        let entry = self.entry(flow_id)?;
        let outcome = {
            let mut flow = entry.context.lock().await;
            let policy = match flow.plan.step(step_id) {
                Some(step) => self.inner.config.retry.for_step(step),
                None => return Err(CoreError::ExecutionNotFound(step_id.0.clone())),
            };
            flow.step_failed(step_id, token, error, &policy, retryable)?
        };
        if let FailureOutcome::Retrying { next_retry_at, .. } = outcome {
            debug!(flow_id = %flow_id, step_id = %step_id, %next_retry_at, "Work item awaiting retry");
        }
        self.advance(&entry, true).await;
        Ok(())
    }

    /// Fail the flow because a step reported an unrecoverable condition
    pub async fn exception_work(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        token: &Token,
        message: &str,
    ) -> Result<(), CoreError> {
        let entry = self.entry(flow_id)?;
        {
            let mut flow = entry.context.lock().await;
            flow.step_exception(step_id, token, message)?;
        }
        self.advance(&entry, true).await;
        Ok(())
    }

    pub(crate) async fn apply_outcome(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        token: &Token,
        outcome: WorkOutcome,
    ) -> Result<(), CoreError> {
        match outcome {
            WorkOutcome::Completed(raw) => self.complete_work(flow_id, step_id, token, raw).await,
            WorkOutcome::Failed { error, retryable } => {
                self.fail_work(flow_id, step_id, token, &error, retryable)
                    .await
            }
            WorkOutcome::Exception(message) => {
                self.exception_work(flow_id, step_id, token, &message)
                    .await
            }
            WorkOutcome::Pending => Ok(()),
        }
    }

    pub(crate) fn step_client(&self) -> &dyn StepClient {
        self.inner.client.as_ref()
    }

    /// Checked health by step, before flow steps are derived
    pub(crate) fn recorded_health(&self) -> &DashMap<StepId, HealthState> {
        &self.inner.health
    }

    /// When each step last completed work
    pub(crate) fn last_success(&self) -> &DashMap<StepId, Instant> {
        &self.inner.last_success
    }

    pub(crate) fn observer(&self) -> Option<&Arc<dyn EngineObserver>> {
        self.inner.observer.as_ref()
    }

    fn entry(&self, id: &FlowId) -> Result<Arc<FlowEntry>, CoreError> {
        self.inner
            .flows
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::FlowNotFound(id.0.clone()))
    }

    /// Start ready steps and dispatch due work, then act on the result
    /// outside the lock
    async fn advance(&self, entry: &Arc<FlowEntry>, persist: bool) {
        let (jobs, events, snapshot, status, child_result) = {
            let mut flow = entry.context.lock().await;
            let jobs = self.schedule(&mut flow);
            let events = flow.take_events();

            let snapshot = if persist || !jobs.is_empty() || !events.is_empty() {
                let version = entry.version.fetch_add(1, Ordering::Relaxed) + 1;
                Some((flow.id.clone(), version, serde_json::to_vec(&*flow)))
            } else {
                None
            };

            let finished = events.iter().any(|e| {
                matches!(e, FlowEvent::FlowCompleted { .. } | FlowEvent::FlowFailed { .. })
            });
            let child_result = match (&flow.parent, finished) {
                (Some(parent), true) => Some(ChildResult {
                    parent: parent.clone(),
                    status: flow.status,
                    state: flow.state.clone(),
                    error: flow.error_state.clone(),
                }),
                _ => None,
            };
            (jobs, events, snapshot, flow.status, child_result)
        };

        // Persist before waiters observe the new status
        if let Some((id, version, encoded)) = snapshot {
            match encoded {
                Ok(bytes) => self.save_snapshot(entry, &id, version, bytes).await,
                Err(e) => error!(flow_id = %id, error = %e, "Failed to encode flow snapshot"),
            }
        }

        // A racing advance can finish its save later with an older status.
        // Terminal is final.
        entry.status.send_if_modified(|current| {
            if current.is_terminal() || *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        for event in events {
            self.publish(event);
        }

        for job in jobs {
            tokio::spawn(self.clone().run_job(job));
        }
        if let Some(result) = child_result {
            tokio::spawn(self.clone().notify_parent(result));
        }
    }

    /// Under the flow lock: start every ready step and collect due work items
    fn schedule(&self, flow: &mut FlowContext) -> Vec<Job> {
        // Starting a step can resolve inputs for others; a step that could
        // not leave pending is not retried in this pass
        let mut attempted = BTreeSet::new();
        loop {
            let ready: Vec<StepId> = flow
                .ready_steps()
                .into_iter()
                .filter(|id| !attempted.contains(id))
                .collect();
            if ready.is_empty() {
                break;
            }
            for step_id in ready {
                if flow.is_terminal() {
                    break;
                }
                self.start_step(flow, &step_id);
                attempted.insert(step_id);
            }
        }

        let mut jobs = Vec::new();
        for (step_id, token) in flow.due_work(Utc::now()) {
            let Some(step) = flow.plan.step(&step_id).cloned() else {
                continue;
            };
            match flow.step_dispatched(&step_id, &token) {
                Ok(inputs) => jobs.push(Job {
                    flow_id: flow.id.clone(),
                    step,
                    token,
                    inputs,
                    depth: flow.depth,
                }),
                Err(e) => debug!(flow_id = %flow.id, step_id = %step_id, error = %e, "Dispatch skipped"),
            }
        }
        jobs
    }

    fn start_step(&self, flow: &mut FlowContext, step_id: &StepId) {
        let Some(step) = flow.plan.step(step_id).cloned() else {
            return;
        };
        let inputs = flow.collect_inputs(&step);

        if let Some(predicate) = &step.predicate {
            match script::evaluate_predicate(predicate, &inputs) {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(e) = flow.step_skipped(step_id, "predicate returned false") {
                        warn!(flow_id = %flow.id, step_id = %step_id, error = %e, "Failed to skip step");
                    }
                    return;
                }
                Err(e) => {
                    let message = format!("predicate failed: {}", e);
                    fail_before_dispatch(flow, step_id, inputs, &message);
                    return;
                }
            }
        }

        let items = match expand_work_items(&step, &inputs, self.inner.config.max_work_items) {
            Ok(items) => items,
            Err(e) => {
                fail_before_dispatch(flow, step_id, inputs, &e.to_string());
                return;
            }
        };
        if let Err(e) = flow.step_started(step_id, inputs, items) {
            warn!(flow_id = %flow.id, step_id = %step_id, error = %e, "Failed to start step");
        }
    }

    fn run_job(self, job: Job) -> BoxFuture<'static, ()> {
        async move {
            if let Some(observer) = self.observer() {
                observer.on_dispatch(&job.step);
            }
            debug!(
                flow_id = %job.flow_id,
                step_id = %job.step.id,
                token = %job.token,
                step_type = job.step.step_type.as_str(),
                "Dispatching work item"
            );

            let outcome = AssertUnwindSafe(self.execute(&job))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| WorkOutcome::Failed {
                    error: format!("{} {}", PANIC_MARKER, panic_message(panic.as_ref())),
                    retryable: true,
                });

            if let Err(e) = self
                .apply_outcome(&job.flow_id, &job.step.id, &job.token, outcome)
                .await
            {
                if e.is_stale() {
                    debug!(flow_id = %job.flow_id, step_id = %job.step.id, error = %e, "Dropped stale result");
                } else {
                    warn!(flow_id = %job.flow_id, step_id = %job.step.id, error = %e, "Failed to apply result");
                }
            }
        }
        .boxed()
    }

    async fn execute(&self, job: &Job) -> WorkOutcome {
        if let Some(raw) = self.inner.memo.get(&job.step, &job.inputs) {
            return WorkOutcome::Completed(raw);
        }

        let arguments = match mapping::map_inputs(&job.step, &job.inputs) {
            Ok(arguments) => arguments,
            Err(e) => {
                return WorkOutcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                }
            }
        };

        match job.step.step_type {
            StepType::Script => match &job.step.script {
                Some(config) => match script::run_script(config, &arguments) {
                    Ok(outputs) => WorkOutcome::Completed(outputs),
                    Err(e) => WorkOutcome::Failed {
                        error: e.to_string(),
                        retryable: false,
                    },
                },
                None => missing_config(&job.step),
            },
            StepType::Sync => {
                let Some(http) = &job.step.http else {
                    return missing_config(&job.step);
                };
                let timeout = self.timeout_for(http.timeout_ms);
                let request = self.request(job, arguments, None);
                let call = self.inner.client.invoke(&http.endpoint, timeout, &request);
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(result)) => result.into_outcome(),
                    Ok(Err(e)) => e.into(),
                    Err(_) => CoreError::Timeout(format!(
                        "{} did not respond within {:?}",
                        http.endpoint, timeout
                    ))
                    .into(),
                }
            }
            StepType::Async => {
                let Some(http) = &job.step.http else {
                    return missing_config(&job.step);
                };
                let timeout = self.timeout_for(http.timeout_ms);
                let webhook_url = self.inner.config.webhook_url(
                    job.flow_id.as_ref(),
                    job.step.id.as_ref(),
                    job.token.as_ref(),
                );
                let request = self.request(job, arguments, Some(webhook_url));
                let call = self
                    .inner
                    .client
                    .dispatch_async(&http.endpoint, timeout, &request);
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(())) => WorkOutcome::Pending,
                    Ok(Err(e)) => e.into(),
                    Err(_) => CoreError::Timeout(format!(
                        "{} did not accept work within {:?}",
                        http.endpoint, timeout
                    ))
                    .into(),
                }
            }
            StepType::Flow => self.start_subflow(job, arguments).await,
        }
    }

    async fn start_subflow(&self, job: &Job, arguments: Args) -> WorkOutcome {
        let Some(config) = &job.step.flow else {
            return missing_config(&job.step);
        };
        let depth = job.depth + 1;
        if depth > self.inner.config.max_subflow_depth {
            let err = CoreError::RecursionLimit(format!(
                "step {} would nest flows {} deep (limit {})",
                job.step.id, depth, self.inner.config.max_subflow_depth
            ));
            return WorkOutcome::Exception(err.to_string());
        }

        let child_id = job.flow_id.child(&job.step.id, &job.token);
        let parent = ParentRef {
            flow_id: job.flow_id.clone(),
            step_id: job.step.id.clone(),
            token: job.token.clone(),
        };
        let init = mapping::subflow_init(config, &arguments);
        match self
            .start_nested(child_id.clone(), &config.goals, init, Some(parent), depth)
            .await
        {
            Ok(_) => {
                debug!(flow_id = %job.flow_id, child_flow_id = %child_id, "Sub-flow started");
                WorkOutcome::Pending
            }
            Err(e) => WorkOutcome::Failed {
                error: format!("sub-flow failed to start: {}", e),
                retryable: false,
            },
        }
    }

    fn notify_parent(self, result: ChildResult) -> BoxFuture<'static, ()> {
        async move {
            let ChildResult {
                parent,
                status,
                state,
                error,
            } = result;

            let step = match self.entry(&parent.flow_id) {
                Ok(entry) => entry.context.lock().await.plan.step(&parent.step_id).cloned(),
                Err(_) => None,
            };
            let Some(step) = step else {
                debug!(flow_id = %parent.flow_id, step_id = %parent.step_id, "Parent of finished sub-flow is gone");
                return;
            };

            let outcome = match status {
                FlowStatus::Completed => WorkOutcome::Completed(match &step.flow {
                    Some(config) => mapping::subflow_outputs(config, &state),
                    None => state,
                }),
                FlowStatus::Failed => WorkOutcome::Failed {
                    error: error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "sub-flow failed".to_string()),
                    retryable: false,
                },
                FlowStatus::Active => return,
            };

            if let Err(e) = self
                .apply_outcome(&parent.flow_id, &parent.step_id, &parent.token, outcome)
                .await
            {
                debug!(flow_id = %parent.flow_id, step_id = %parent.step_id, error = %e, "Sub-flow result not applied");
            }
        }
        .boxed()
    }

    fn request(&self, job: &Job, arguments: Args, webhook_url: Option<String>) -> StepRequest {
        StepRequest {
            arguments,
            metadata: RequestMetadata {
                flow_id: job.flow_id.clone(),
                step_id: job.step.id.clone(),
                token: job.token.clone(),
                webhook_url,
            },
        }
    }

    fn timeout_for(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.inner.config.step_timeout(),
        }
    }

    fn publish(&self, event: FlowEvent) {
        if let FlowEvent::StepCompleted { step_id, .. } = &event {
            self.inner.last_success.insert(step_id.clone(), Instant::now());
        }
        if let Some(observer) = self.observer() {
            observer.on_event(&event);
        }
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Saves for one flow run one at a time; a snapshot older than the
    /// last one saved is dropped.
    async fn save_snapshot(&self, entry: &FlowEntry, id: &FlowId, version: u64, bytes: Vec<u8>) {
        let mut saved = entry.saved.lock().await;
        if version <= *saved {
            trace!(flow_id = %id, version, "Skipping superseded flow snapshot");
            return;
        }
        let key = SnapshotKey::new(&self.inner.config.namespace, id);
        if let Err(e) = self.inner.store.save(&key, bytes).await {
            error!(flow_id = %id, error = %e, "Failed to save flow snapshot");
        }
        *saved = version;
    }
}

/// Fail a pending step outright, without consuming retries
fn fail_before_dispatch(flow: &mut FlowContext, step_id: &StepId, inputs: Args, message: &str) {
    let result = (|| -> Result<(), CoreError> {
        let tokens = flow.step_started(step_id, inputs.clone(), vec![inputs])?;
        for token in tokens {
            flow.step_dispatched(step_id, &token)?;
            flow.step_failed(step_id, &token, message, &RetryPolicy::default(), false)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!(flow_id = %flow.id, step_id = %step_id, error = %e, "Failed to record step failure");
    }
}

fn missing_config(step: &Step) -> WorkOutcome {
    WorkOutcome::Failed {
        error: format!("step {} has no {} configuration", step.id, step.step_type.as_str()),
        retryable: false,
    }
}

/// Text carried by a panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_timeout_falls_back_to_engine_default() {
        let engine = Engine::new(EngineConfig::default());
        assert_eq!(engine.timeout_for(None), Duration::from_secs(30));
        assert_eq!(engine.timeout_for(Some(0)), Duration::from_secs(30));
        assert_eq!(engine.timeout_for(Some(250)), Duration::from_millis(250));
    }
}
