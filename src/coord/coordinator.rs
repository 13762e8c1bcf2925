//! Execution coordinator: drives a workflow through its dependency waves.
//!
//! Workers execute actions and report back over an mpsc channel; the drive
//! loop is the only place workflow state is mutated, and every action
//! mutation goes through the lease manager. Waves are strictly ordered: a
//! later wave never starts before the previous wave settles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::coord::executor::{ActionCtx, ExecutorRegistry};
use crate::coord::types::{ActionOutcome, ExecutionEvent};
use crate::core::errors::{Result, WavefrontError};
use crate::lease::manager::{Lease, LeaseManager};
use crate::reducer::bridge::IntentBridge;
use crate::reducer::machine::{ReducerState, ReducerStateMachine};
use crate::storage::{SnapshotStore, WorkflowSnapshot};
use crate::workflow::resolver::{DependencyGraphResolver, Wave};
use crate::workflow::types::{
    Action, ActionId, ActionResult, ActionStatus, ActionType, BatchSelection, ExecutionMode,
    ExecutionStatus, FailureStrategy, RetryStrategy, StepFailure, StepId, WorkflowConfig,
    WorkflowDefinition, WorkflowId, WorkflowResult, WorkflowStep,
};

/// Attaches a reducer to the coordinator: settled `Reduce` actions are folded
/// through the machine and emitted intents are bridged back into root actions.
#[derive(Clone)]
pub struct ReducerBinding {
    pub machine: Arc<ReducerStateMachine>,
    pub initial_state: ReducerState,
    pub bridge: IntentBridge,
}

struct WorkflowEntry {
    result: WorkflowResult,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// The orchestration entry point. Owns its workflow registry explicitly;
/// nothing here is process-wide state.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    registry: Arc<ExecutorRegistry>,
    leases: Arc<LeaseManager>,
    workflows: Arc<DashMap<WorkflowId, WorkflowEntry>>,
    defaults: WorkflowConfig,
    store: Option<Arc<dyn SnapshotStore>>,
    reducer: Option<Arc<ReducerBinding>>,
}

impl ExecutionCoordinator {
    pub fn new(registry: ExecutorRegistry, defaults: WorkflowConfig) -> Self {
        let leases = Arc::new(LeaseManager::new(defaults.lease_ttl_ms));
        Self {
            registry: Arc::new(registry),
            leases,
            workflows: Arc::new(DashMap::new()),
            defaults,
            store: None,
            reducer: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reducer(mut self, binding: ReducerBinding) -> Self {
        self.reducer = Some(Arc::new(binding));
        self
    }

    /// The lease manager owned by this coordinator
    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Submit a workflow. Structural validation is synchronous and happens
    /// before any lease is acquired; on success a drive task is spawned and
    /// the workflow id returned immediately.
    pub fn submit(&self, definition: WorkflowDefinition) -> Result<WorkflowId> {
        let config = match &definition.config {
            Some(config) => WorkflowConfig::merge(&self.defaults, config)?,
            None => {
                self.defaults.validate()?;
                self.defaults.clone()
            }
        };

        let waves = DependencyGraphResolver::resolve(&definition.steps)?;
        DependencyGraphResolver::validate_actions(&definition.steps)?;
        for step in &definition.steps {
            for action in &step.actions {
                if !self.registry.contains(&action.target_node_type) {
                    return Err(WavefrontError::ExecutorNotRegistered {
                        target: action.target_node_type.clone(),
                    });
                }
            }
        }

        let workflow_id = definition.workflow_id.clone();
        if self.workflows.contains_key(&workflow_id) {
            return Err(WavefrontError::validation_field(
                format!("workflow '{workflow_id}' already submitted"),
                "workflow_id",
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.workflows.insert(
            workflow_id.clone(),
            WorkflowEntry {
                result: WorkflowResult::pending(workflow_id.clone()),
                cancel_tx,
                done_rx,
            },
        );

        info!(workflow_id = %workflow_id, steps = definition.steps.len(), "workflow submitted");
        let run = WorkflowRun::new(self, definition, config, waves, cancel_rx);
        tokio::spawn(run.drive(done_tx));
        Ok(workflow_id)
    }

    /// Current result snapshot for a workflow
    pub fn status(&self, workflow_id: &str) -> Result<WorkflowResult> {
        self.workflows
            .get(workflow_id)
            .map(|e| e.result.clone())
            .ok_or_else(|| WavefrontError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Signal cancellation. Cooperative: in-flight executor calls are
    /// signaled but not forcibly killed; the coordinator stops issuing new
    /// dispatches and finalizes as `Cancelled` once outstanding calls settle.
    pub fn cancel(&self, workflow_id: &str) -> Result<()> {
        let entry =
            self.workflows
                .get(workflow_id)
                .ok_or_else(|| WavefrontError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                })?;
        let _ = entry.cancel_tx.send(true);
        info!(workflow_id, "cancellation requested");
        Ok(())
    }

    /// Await a workflow's terminal result
    pub async fn wait(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let mut done_rx = self
            .workflows
            .get(workflow_id)
            .map(|e| e.done_rx.clone())
            .ok_or_else(|| WavefrontError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        loop {
            if *done_rx.borrow() {
                break;
            }
            if done_rx.changed().await.is_err() {
                break;
            }
        }
        self.status(workflow_id)
    }

    /// Submit and run to completion. Structural validation failures yield a
    /// `Failed` result synchronously, without the workflow ever entering
    /// `Running`.
    pub async fn process(&self, definition: WorkflowDefinition) -> Result<WorkflowResult> {
        let workflow_id = definition.workflow_id.clone();
        match self.submit(definition) {
            Ok(id) => self.wait(&id).await,
            Err(err)
                if matches!(
                    err,
                    WavefrontError::Validation { .. }
                        | WavefrontError::CycleDetected { .. }
                        | WavefrontError::UnknownDependency { .. }
                        | WavefrontError::ExecutorNotRegistered { .. }
                ) =>
            {
                let mut result = WorkflowResult::pending(workflow_id.clone());
                result.execution_status = ExecutionStatus::Failed;
                result.failed_steps.push(StepFailure {
                    step_id: workflow_id,
                    kind: err.category().to_string(),
                    message: err.to_string(),
                    attempts: 0,
                });
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }
}

/// Per-run mutable state, owned by the drive task. The drive loop applies
/// every mutation; workers only execute and report.
struct WorkflowRun {
    workflow_id: WorkflowId,
    config: WorkflowConfig,
    registry: Arc<ExecutorRegistry>,
    leases: Arc<LeaseManager>,
    workflows: Arc<DashMap<WorkflowId, WorkflowEntry>>,
    store: Option<Arc<dyn SnapshotStore>>,
    reducer: Option<Arc<ReducerBinding>>,

    steps: HashMap<StepId, WorkflowStep>,
    waves: Vec<Wave>,
    actions: HashMap<ActionId, Action>,

    lease: Option<Lease>,
    reducer_state: Option<ReducerState>,
    pending_bridged: VecDeque<ActionId>,

    completed_steps: Vec<StepId>,
    failed_steps: Vec<StepFailure>,
    completed_ids: HashSet<StepId>,
    failed_ids: HashSet<StepId>,
    actions_emitted: u64,

    started: Instant,
    deadline: Option<Instant>,
    cancel_rx: watch::Receiver<bool>,
    cancelled: bool,
    aborted: bool,
    fatal: Option<StepFailure>,
}

impl WorkflowRun {
    fn new(
        coordinator: &ExecutionCoordinator,
        definition: WorkflowDefinition,
        config: WorkflowConfig,
        waves: Vec<Wave>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let started = Instant::now();
        let deadline = config
            .timeout_ms
            .map(|ms| started + Duration::from_millis(ms));

        let mut steps = HashMap::with_capacity(definition.steps.len());
        let mut actions = HashMap::new();
        for step in definition.steps {
            for action in &step.actions {
                // Step-level timeout/retry are defaults for actions that
                // leave theirs unset
                let mut action = action.clone();
                if action.timeout_ms == 0 {
                    action.timeout_ms = step.timeout_ms;
                }
                if action.retry_count == 0 {
                    action.retry_count = step.retry_count;
                }
                actions.insert(action.action_id.clone(), action);
            }
            steps.insert(step.step_id.clone(), step);
        }

        Self {
            workflow_id: definition.workflow_id,
            config,
            registry: coordinator.registry.clone(),
            leases: coordinator.leases.clone(),
            workflows: coordinator.workflows.clone(),
            store: coordinator.store.clone(),
            reducer: coordinator.reducer.clone(),
            steps,
            waves,
            actions,
            lease: None,
            reducer_state: None,
            pending_bridged: VecDeque::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            completed_ids: HashSet::new(),
            failed_ids: HashSet::new(),
            actions_emitted: 0,
            started,
            deadline,
            cancel_rx,
            cancelled: false,
            aborted: false,
            fatal: None,
        }
    }

    async fn drive(mut self, done_tx: watch::Sender<bool>) {
        self.publish(ExecutionStatus::Running);

        match self.leases.acquire(&self.workflow_id) {
            Ok(lease) => {
                for action in self.actions.values_mut() {
                    if let Err(err) = self.leases.stamp(&self.workflow_id, action) {
                        self.fatal = Some(StepFailure {
                            step_id: self.workflow_id.clone(),
                            kind: err.category().to_string(),
                            message: err.to_string(),
                            attempts: 0,
                        });
                        break;
                    }
                }
                self.lease = Some(lease);
            }
            Err(err) => {
                self.record_fatal(err);
            }
        }

        if self.fatal.is_none() {
            self.execute_waves().await;
            self.drain_bridged().await;
        }

        let status = self.finalize().await;
        info!(
            workflow_id = %self.workflow_id,
            status = ?status,
            completed = self.completed_steps.len(),
            failed = self.failed_steps.len(),
            emitted = self.actions_emitted,
            "workflow finished"
        );
        let _ = done_tx.send(true);
    }

    async fn execute_waves(&mut self) {
        let waves = self.waves.clone();
        for (i, wave) in waves.iter().enumerate() {
            if self.aborted || self.cancelled {
                break;
            }
            if self.is_cancel_requested() {
                self.cancelled = true;
                break;
            }
            if let Some(lease) = self.lease.clone() {
                match self.leases.renew(&lease) {
                    Ok(renewed) => self.lease = Some(renewed),
                    Err(err) => {
                        self.record_fatal(err);
                        break;
                    }
                }
            }
            debug!(workflow_id = %self.workflow_id, wave = i, steps = wave.len(), "dispatching wave");
            self.run_wave(wave).await;
            self.drain_bridged().await;
        }
    }

    /// Dispatch one wave of steps and drain worker events until the wave
    /// settles. Steps whose dependencies failed are recorded without
    /// dispatch; the workflow deadline is checked before every dispatch.
    async fn run_wave(&mut self, wave: &[StepId]) {
        let mut to_dispatch: Vec<WorkflowStep> = Vec::new();
        for step_id in wave {
            if self.aborted {
                break;
            }
            let step = match self.steps.get(step_id) {
                Some(step) => step.clone(),
                None => continue,
            };
            if let Some(dep) = step
                .depends_on
                .iter()
                .find(|d| !self.completed_ids.contains(*d))
            {
                let message = if self.failed_ids.contains(dep) {
                    format!("dependency '{dep}' failed")
                } else {
                    format!("dependency '{dep}' did not complete")
                };
                self.record_step_failure(StepFailure {
                    step_id: step_id.clone(),
                    kind: "dependency_failed".to_string(),
                    message,
                    attempts: 0,
                });
                continue;
            }
            if self.deadline_exceeded() {
                self.record_step_failure(StepFailure {
                    step_id: step_id.clone(),
                    kind: "timeout".to_string(),
                    message: "workflow deadline exceeded before dispatch".to_string(),
                    attempts: 0,
                });
                continue;
            }
            to_dispatch.push(step);
        }
        if to_dispatch.is_empty() {
            return;
        }

        let selection = match self.config.mode {
            ExecutionMode::Batch => self.config.batch_selection,
            _ => BatchSelection::LeastLoaded,
        };
        if self.config.mode == ExecutionMode::Batch {
            // Same-target steps form contiguous batches; the stable sort
            // keeps priority order within each batch
            to_dispatch.sort_by_key(|s| {
                s.actions
                    .first()
                    .map(|a| a.target_node_type.clone())
                    .unwrap_or_default()
            });
        }

        match self.config.mode {
            ExecutionMode::Sequential => {
                for step in to_dispatch {
                    if self.aborted || self.cancelled {
                        break;
                    }
                    self.dispatch_and_drain(vec![step], 1, selection).await;
                }
            }
            ExecutionMode::Parallel | ExecutionMode::Batch => {
                let limit = self.config.max_parallel_steps.max(1);
                self.dispatch_and_drain(to_dispatch, limit, selection).await;
            }
        }
    }

    async fn dispatch_and_drain(
        &mut self,
        steps: Vec<WorkflowStep>,
        limit: usize,
        selection: BatchSelection,
    ) {
        let (evt_tx, mut evt_rx) = mpsc::channel::<ExecutionEvent>(64);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut remaining: HashSet<StepId> = HashSet::new();

        for step in steps {
            remaining.insert(step.step_id.clone());
            let actions: Vec<Action> = step
                .actions
                .iter()
                .filter_map(|a| self.actions.get(&a.action_id).cloned())
                .collect();
            tokio::spawn(run_step_worker(
                self.workflow_id.clone(),
                step.step_id.clone(),
                actions,
                self.registry.clone(),
                selection,
                self.config.retry_strategy.clone(),
                self.deadline,
                semaphore.clone(),
                self.cancel_rx.clone(),
                evt_tx.clone(),
            ));
        }
        drop(evt_tx);

        let mut cancel_rx = self.cancel_rx.clone();
        while !remaining.is_empty() {
            tokio::select! {
                maybe_evt = evt_rx.recv() => match maybe_evt {
                    Some(evt) => {
                        if let ExecutionEvent::StepSettled { step_id, .. } = &evt {
                            remaining.remove(step_id);
                        }
                        self.apply_event(evt);
                    }
                    None => {
                        // Workers gone without settling: account for the loss
                        for step_id in remaining.drain() {
                            self.record_step_failure(StepFailure {
                                step_id,
                                kind: "internal".to_string(),
                                message: "worker exited without settling".to_string(),
                                attempts: 0,
                            });
                        }
                    }
                },
                _ = cancel_rx.changed() => {
                    self.cancelled = true;
                    // keep draining; workers observe the same signal
                }
            }
        }
    }

    /// The single mutation point: every state change flows through here and
    /// through the lease manager.
    fn apply_event(&mut self, evt: ExecutionEvent) {
        match evt {
            ExecutionEvent::ActionStarted {
                action_id, attempt, ..
            } => {
                debug!(workflow_id = %self.workflow_id, action_id = %action_id, attempt, "action started");
                self.update_action(&action_id, ActionStatus::Running, None);
            }
            ExecutionEvent::ActionSettled {
                action_id, outcome, ..
            } => {
                self.settle_action(&action_id, outcome);
            }
            ExecutionEvent::StepSettled { step_id, failure } => match failure {
                None => {
                    self.completed_ids.insert(step_id.clone());
                    self.completed_steps.push(step_id);
                    self.publish(ExecutionStatus::Running);
                }
                Some(failure) => {
                    if failure.kind == "cancelled" {
                        self.cancelled = true;
                    } else {
                        self.record_step_failure(failure);
                    }
                    self.publish(ExecutionStatus::Running);
                }
            },
        }
    }

    fn settle_action(&mut self, action_id: &str, outcome: ActionOutcome) {
        let status = outcome.status();
        if let ActionOutcome::Completed { result, .. } = outcome {
            // A completed action's payload becomes the result payload,
            // the one place `advance` carries new data
            self.update_action(action_id, status, result.payload.clone());
            let action = self.actions.get(action_id).cloned();
            if let Some(action) = action {
                if action.action_type == ActionType::Reduce {
                    self.fold_reducer(&action, &result);
                }
            }
        } else {
            self.update_action(action_id, status, None);
        }
    }

    fn update_action(&mut self, action_id: &str, status: ActionStatus, new_payload: Option<Value>) {
        let current = match self.actions.get(action_id) {
            Some(action) if !action.status.is_terminal() => action.clone(),
            _ => return,
        };
        let payload = new_payload.unwrap_or_else(|| current.payload.clone());
        match self
            .leases
            .advance_owned(&self.workflow_id, &current, payload)
        {
            Ok(mut next) => {
                next.status = status;
                self.actions.insert(action_id.to_string(), next);
            }
            Err(err) => self.record_fatal(err),
        }
    }

    fn record_step_failure(&mut self, failure: StepFailure) {
        warn!(
            workflow_id = %self.workflow_id,
            step_id = %failure.step_id,
            kind = %failure.kind,
            message = %failure.message,
            "step failed"
        );
        self.failed_ids.insert(failure.step_id.clone());
        self.failed_steps.push(failure);
        if self.config.failure_strategy == FailureStrategy::FailFast {
            self.aborted = true;
        }
    }

    fn record_fatal(&mut self, err: WavefrontError) {
        error!(workflow_id = %self.workflow_id, error = %err, "fatal coordination error");
        if self.fatal.is_none() {
            self.fatal = Some(StepFailure {
                step_id: self.workflow_id.clone(),
                kind: err.category().to_string(),
                message: err.to_string(),
                attempts: 0,
            });
        }
        self.aborted = true;
    }

    /// Fold a settled reduce action through the bound reducer and queue the
    /// bridged actions it emits.
    fn fold_reducer(&mut self, action: &Action, result: &ActionResult) {
        let Some(binding) = self.reducer.clone() else {
            return;
        };
        let payload = result.payload.clone().unwrap_or(Value::Null);
        let trigger = payload
            .get("trigger")
            .and_then(|v| v.as_str())
            .or_else(|| action.payload.get("trigger").and_then(|v| v.as_str()))
            .map(str::to_string);
        let Some(trigger) = trigger else {
            debug!(action_id = %action.action_id, "reduce action carried no trigger");
            return;
        };

        let state = self
            .reducer_state
            .get_or_insert_with(|| binding.initial_state.clone())
            .clone();
        // Event identity is the action id: re-delivery of the same intent
        // yields the same action, so the reducer sees the same event id
        let (next, intents) = binding
            .machine
            .reduce(&state, &trigger, &action.action_id, &payload);
        self.reducer_state = Some(next);

        if intents.is_empty() {
            return;
        }
        let Some(lease) = self.leases.current(&self.workflow_id) else {
            self.record_fatal(WavefrontError::LeaseExpired {
                workflow_id: self.workflow_id.clone(),
            });
            return;
        };
        for bridged in binding.bridge.materialize_all(&intents, &lease) {
            if self.actions.contains_key(&bridged.action_id) {
                debug!(action_id = %bridged.action_id, "bridged action already known, skipping");
                continue;
            }
            self.actions_emitted += 1;
            self.pending_bridged.push_back(bridged.action_id.clone());
            self.actions.insert(bridged.action_id.clone(), bridged);
        }
    }

    /// Run bridged root actions until the queue drains. Completed reduce
    /// actions may emit further intents, so this loops until quiescence.
    async fn drain_bridged(&mut self) {
        while !self.pending_bridged.is_empty() && !self.aborted && !self.cancelled {
            let queued: Vec<ActionId> = self.pending_bridged.drain(..).collect();
            let mut batch: Vec<Action> = Vec::new();
            for action_id in queued {
                let action = match self.actions.get(&action_id) {
                    Some(a) => a.clone(),
                    None => continue,
                };
                let blocked = action.dependencies.iter().any(|dep| {
                    self.actions
                        .get(dep)
                        .map(|d| !d.status.is_terminal())
                        .unwrap_or(false)
                });
                let dep_failed = action.dependencies.iter().any(|dep| {
                    self.actions
                        .get(dep)
                        .map(|d| d.status.is_terminal() && d.status != ActionStatus::Completed)
                        .unwrap_or(true)
                });
                if dep_failed {
                    self.record_step_failure(StepFailure {
                        step_id: action_id.clone(),
                        kind: "dependency_failed".to_string(),
                        message: "bridged dependency did not complete".to_string(),
                        attempts: 0,
                    });
                } else if blocked {
                    self.pending_bridged.push_back(action_id);
                } else {
                    batch.push(action);
                }
            }
            if batch.is_empty() {
                if !self.pending_bridged.is_empty() {
                    // Everything left is blocked on something that will never
                    // settle in this pass
                    let drained: Vec<_> = self.pending_bridged.drain(..).collect();
                    for action_id in drained {
                        self.record_step_failure(StepFailure {
                            step_id: action_id,
                            kind: "dependency_failed".to_string(),
                            message: "bridged dependency unsatisfiable".to_string(),
                            attempts: 0,
                        });
                    }
                }
                continue;
            }

            let (evt_tx, mut evt_rx) = mpsc::channel::<ExecutionEvent>(64);
            let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps.max(1)));
            let mut futs = FuturesUnordered::new();
            for action in batch {
                let workflow_id = self.workflow_id.clone();
                let registry = self.registry.clone();
                let retry = self.config.retry_strategy.clone();
                let deadline = self.deadline;
                let semaphore = semaphore.clone();
                let mut cancel_rx = self.cancel_rx.clone();
                let evt_tx = evt_tx.clone();
                futs.push(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let action_id = action.action_id.clone();
                    let outcome = run_action(
                        &workflow_id,
                        &action_id,
                        action,
                        &registry,
                        BatchSelection::LeastLoaded,
                        &retry,
                        deadline,
                        &mut cancel_rx,
                        &evt_tx,
                    )
                    .await;
                    (action_id, outcome)
                });
            }
            drop(evt_tx);

            loop {
                let (action_id, outcome) = tokio::select! {
                    maybe_done = futs.next() => match maybe_done {
                        Some(done) => done,
                        None => break,
                    },
                    maybe_evt = evt_rx.recv() => {
                        if let Some(evt) = maybe_evt {
                            self.apply_event(evt);
                        }
                        continue;
                    }
                };
                let attempts = outcome.attempts();
                let failure = match &outcome {
                    ActionOutcome::Completed { .. } | ActionOutcome::Cancelled { .. } => None,
                    ActionOutcome::Failed { kind, message, .. } => Some(StepFailure {
                        step_id: action_id.clone(),
                        kind: kind.clone(),
                        message: message.clone(),
                        attempts,
                    }),
                    ActionOutcome::TimedOut { .. } => Some(StepFailure {
                        step_id: action_id.clone(),
                        kind: if attempts > 1 { "retry_exhausted" } else { "timeout" }.to_string(),
                        message: "bridged action timed out".to_string(),
                        attempts,
                    }),
                };
                let was_completed = matches!(outcome, ActionOutcome::Completed { .. });
                let was_cancelled = matches!(outcome, ActionOutcome::Cancelled { .. });
                self.settle_action(&action_id, outcome);
                if was_completed {
                    self.completed_ids.insert(action_id.clone());
                    self.completed_steps.push(action_id);
                } else if was_cancelled {
                    self.cancelled = true;
                } else if let Some(failure) = failure {
                    self.record_step_failure(failure);
                }
            }
            while let Ok(evt) = evt_rx.try_recv() {
                self.apply_event(evt);
            }
            self.publish(ExecutionStatus::Running);
        }
    }

    async fn finalize(&mut self) -> ExecutionStatus {
        if let Some(fatal) = self.fatal.take() {
            self.failed_ids.insert(fatal.step_id.clone());
            self.failed_steps.push(fatal);
        }

        // Unsettled actions transition to Cancelled rather than being retried
        let unsettled: Vec<ActionId> = self
            .actions
            .iter()
            .filter(|(_, a)| !a.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        if self.cancelled || self.aborted {
            for action_id in unsettled {
                if let Some(action) = self.actions.get_mut(&action_id) {
                    action.status = ActionStatus::Cancelled;
                }
            }
        }

        let status = if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self.aborted {
            ExecutionStatus::Failed
        } else if self.failed_steps.is_empty() {
            ExecutionStatus::Completed
        } else if self.completed_steps.is_empty() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::PartialSuccess
        };

        if let Some(store) = self.store.clone() {
            let snapshot = WorkflowSnapshot {
                workflow_id: self.workflow_id.clone(),
                steps: self.steps.values().cloned().collect(),
                actions: self.actions.values().cloned().collect(),
                current_epoch: self
                    .leases
                    .current(&self.workflow_id)
                    .map(|l| l.epoch)
                    .unwrap_or(0),
                status,
            };
            if let Err(err) = store.save(&snapshot).await {
                // Best-effort: a snapshot failure never fails the workflow
                warn!(workflow_id = %self.workflow_id, error = %err, "snapshot save failed");
            }
        }

        if let Some(lease) = self.lease.take() {
            self.leases.release(&lease);
        }
        self.publish(status);
        status
    }

    fn publish(&self, status: ExecutionStatus) {
        if let Some(mut entry) = self.workflows.get_mut(&self.workflow_id) {
            entry.result = WorkflowResult {
                workflow_id: self.workflow_id.clone(),
                execution_status: status,
                completed_steps: self.completed_steps.clone(),
                failed_steps: self.failed_steps.clone(),
                actions_emitted: self.actions_emitted,
                execution_time_ms: self.started.elapsed().as_millis() as u64,
            };
        }
    }

    fn is_cancel_requested(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|dl| Instant::now() >= dl)
            .unwrap_or(false)
    }
}

/// Execute one step's actions in declaration order, reporting progress and
/// settlement over the event channel. The first failed action abandons the
/// rest of the step.
#[allow(clippy::too_many_arguments)]
async fn run_step_worker(
    workflow_id: WorkflowId,
    step_id: StepId,
    actions: Vec<Action>,
    registry: Arc<ExecutorRegistry>,
    selection: BatchSelection,
    retry: RetryStrategy,
    deadline: Option<Instant>,
    semaphore: Arc<Semaphore>,
    mut cancel_rx: watch::Receiver<bool>,
    evt_tx: mpsc::Sender<ExecutionEvent>,
) {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    for action in actions {
        let action_id = action.action_id.clone();
        let outcome = run_action(
            &workflow_id,
            &step_id,
            action,
            &registry,
            selection,
            &retry,
            deadline,
            &mut cancel_rx,
            &evt_tx,
        )
        .await;
        let attempts = outcome.attempts();
        let failure = match &outcome {
            ActionOutcome::Completed { .. } => None,
            ActionOutcome::Failed { kind, message, .. } => Some(StepFailure {
                step_id: step_id.clone(),
                kind: kind.clone(),
                message: message.clone(),
                attempts,
            }),
            ActionOutcome::TimedOut { .. } => Some(StepFailure {
                step_id: step_id.clone(),
                kind: if attempts > 1 { "retry_exhausted" } else { "timeout" }.to_string(),
                message: format!("action '{action_id}' timed out after {attempts} attempts"),
                attempts,
            }),
            ActionOutcome::Cancelled { .. } => Some(StepFailure {
                step_id: step_id.clone(),
                kind: "cancelled".to_string(),
                message: format!("action '{action_id}' cancelled"),
                attempts,
            }),
        };
        let _ = evt_tx
            .send(ExecutionEvent::ActionSettled {
                step_id: step_id.clone(),
                action_id,
                outcome,
            })
            .await;
        if let Some(failure) = failure {
            let _ = evt_tx
                .send(ExecutionEvent::StepSettled {
                    step_id,
                    failure: Some(failure),
                })
                .await;
            return;
        }
    }
    let _ = evt_tx
        .send(ExecutionEvent::StepSettled {
            step_id,
            failure: None,
        })
        .await;
}

/// One action under timeout/retry policy. The effective deadline per attempt
/// is the lesser of the action's own timeout and the remaining workflow
/// budget; backoff between attempts follows the configured strategy.
#[allow(clippy::too_many_arguments)]
async fn run_action(
    workflow_id: &str,
    step_id: &str,
    action: Action,
    registry: &ExecutorRegistry,
    selection: BatchSelection,
    retry: &RetryStrategy,
    deadline: Option<Instant>,
    cancel_rx: &mut watch::Receiver<bool>,
    evt_tx: &mpsc::Sender<ExecutionEvent>,
) -> ActionOutcome {
    let max_attempts = action.retry_count.saturating_add(1);
    let mut attempts = 0u32;
    let mut last_kind: &'static str = "executor_failure";
    let mut last_message = String::new();

    loop {
        if *cancel_rx.borrow() {
            return ActionOutcome::Cancelled { attempts };
        }
        attempts += 1;
        let _ = evt_tx
            .send(ExecutionEvent::ActionStarted {
                step_id: step_id.to_string(),
                action_id: action.action_id.clone(),
                attempt: attempts,
            })
            .await;

        let mut budget = Duration::from_millis(action.timeout_ms.max(1));
        if let Some(dl) = deadline {
            let now = Instant::now();
            if now >= dl {
                return ActionOutcome::TimedOut { attempts };
            }
            budget = budget.min(dl - now);
        }

        let handle = match registry.select(&action.target_node_type, selection) {
            Ok(handle) => handle,
            Err(err) => {
                return ActionOutcome::Failed {
                    kind: "executor_not_registered".to_string(),
                    message: err.to_string(),
                    attempts,
                }
            }
        };
        let ctx = ActionCtx {
            workflow_id: workflow_id.to_string(),
            action: action.clone(),
            attempt: attempts,
            cancelled: cancel_rx.clone(),
        };
        let call_started = Instant::now();

        let attempt_result: std::result::Result<ActionResult, (&'static str, String)> = tokio::select! {
            res = timeout(budget, handle.executor().execute(&ctx)) => match res {
                Ok(Ok(mut result)) => {
                    if result.duration_ms == 0 {
                        result.duration_ms = call_started.elapsed().as_millis() as u64;
                    }
                    if result.success {
                        Ok(result)
                    } else {
                        Err((
                            "executor_failure",
                            result
                                .error
                                .unwrap_or_else(|| "executor reported failure".to_string()),
                        ))
                    }
                }
                Ok(Err(err)) => Err(("executor_failure", err.to_string())),
                Err(_) => Err((
                    "timeout",
                    format!("no response within {}ms", budget.as_millis()),
                )),
            },
            _ = cancel_rx.changed() => {
                return ActionOutcome::Cancelled { attempts };
            }
        };
        drop(handle);

        match attempt_result {
            Ok(result) => return ActionOutcome::Completed { result, attempts },
            Err((kind, message)) => {
                warn!(
                    workflow_id,
                    action_id = %action.action_id,
                    attempt = attempts,
                    kind,
                    %message,
                    "action attempt failed"
                );
                last_kind = kind;
                last_message = message;
            }
        }

        if attempts >= max_attempts {
            if last_kind == "timeout" {
                return ActionOutcome::TimedOut { attempts };
            }
            let kind = if attempts > 1 {
                "retry_exhausted".to_string()
            } else {
                last_kind.to_string()
            };
            return ActionOutcome::Failed {
                kind,
                message: last_message,
                attempts,
            };
        }

        let delay = retry.delay_for(attempts);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel_rx.changed() => return ActionOutcome::Cancelled { attempts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::executor::StepExecutor;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        fn target(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: &ActionCtx) -> anyhow::Result<ActionResult> {
            Ok(ActionResult::success(ctx.action.payload.clone()))
        }
    }

    fn coordinator() -> ExecutionCoordinator {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        ExecutionCoordinator::new(registry, WorkflowConfig::default())
    }

    #[tokio::test]
    async fn test_empty_workflow_completes_immediately() {
        let coordinator = coordinator();
        let result = coordinator
            .process(WorkflowDefinition::new("empty"))
            .await
            .unwrap();
        assert_eq!(result.execution_status, ExecutionStatus::Completed);
        assert!(result.completed_steps.is_empty());
        assert!(result.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_cycles_synchronously() {
        let coordinator = coordinator();
        let def = WorkflowDefinition::new("cyclic")
            .with_step(WorkflowStep::new("a", "a").depends_on(vec!["b".to_string()]))
            .with_step(WorkflowStep::new("b", "b").depends_on(vec!["a".to_string()]));
        let err = coordinator.submit(def).unwrap_err();
        assert!(matches!(err, WavefrontError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_executor() {
        let coordinator = coordinator();
        let def = WorkflowDefinition::new("bad-target").with_step(
            WorkflowStep::new("s", "s")
                .with_action(Action::new(ActionType::Compute, "ghost", json!({}))),
        );
        let err = coordinator.submit(def).unwrap_err();
        assert!(matches!(err, WavefrontError::ExecutorNotRegistered { .. }));
        // Nothing was registered for the failed submission
        assert!(matches!(
            coordinator.status("missing"),
            Err(WavefrontError::WorkflowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_maps_structural_errors_to_failed_result() {
        let coordinator = coordinator();
        let def = WorkflowDefinition::new("dangling")
            .with_step(WorkflowStep::new("a", "a").depends_on(vec!["ghost".to_string()]));
        let result = coordinator.process(def).await.unwrap();
        assert_eq!(result.execution_status, ExecutionStatus::Failed);
        assert_eq!(result.failed_steps[0].kind, "unknown_dependency");
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let coordinator = coordinator();
        let def = WorkflowDefinition::new("one").with_id("fixed-id");
        coordinator.submit(def.clone()).unwrap();
        let err = coordinator.submit(def).unwrap_err();
        assert!(matches!(err, WavefrontError::Validation { .. }));
    }
}
