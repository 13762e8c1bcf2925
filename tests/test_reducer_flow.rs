//! Integration tests for the reducer feedback loop: settled reduce actions
//! fold through the state machine and emitted intents come back as bridged
//! root actions, until quiescence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use wavefront::{
    Action, ActionCtx, ActionResult, ActionType, ExecutionCoordinator, ExecutionMode,
    ExecutionStatus, ExecutorRegistry, IntentBridge, IntentTemplate, ReducerBinding, ReducerState,
    ReducerStateMachine, StepExecutor, Transition, TransitionTable, WorkflowConfig,
    WorkflowDefinition, WorkflowStep,
};

/// Returns a fixed payload, recording invocation order.
struct ScriptedExecutor {
    target: String,
    response: serde_json::Value,
    log: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedExecutor {
    fn new(target: &str, response: serde_json::Value, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_string(),
            response,
            log,
            calls: Arc::new(AtomicU32::new(0)),
        })
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn target(&self) -> &str {
        &self.target
    }

    async fn execute(&self, ctx: &ActionCtx) -> anyhow::Result<ActionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(ctx.action.action_id.clone());
        Ok(ActionResult::success(self.response.clone()))
    }
}

fn reduce_step(step_id: &str, target: &str) -> WorkflowStep {
    WorkflowStep::new(step_id, step_id).with_action(
        Action::new(ActionType::Reduce, target, json!({})).with_id(format!("{step_id}-act")),
    )
}

fn coordinator_with(
    table: TransitionTable,
    initial: &str,
    registry: ExecutorRegistry,
) -> ExecutionCoordinator {
    let config = WorkflowConfig {
        mode: ExecutionMode::Parallel,
        ..Default::default()
    };
    ExecutionCoordinator::new(registry, config).with_reducer(ReducerBinding {
        machine: Arc::new(ReducerStateMachine::new(table)),
        initial_state: ReducerState::new(initial),
        bridge: IntentBridge::new(5_000, 0),
    })
}

/// A reduce action's result triggers a transition whose intent materializes
/// into a bridged action executed in the same run.
#[tokio::test]
async fn test_intent_materializes_into_bridged_action() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ExecutorRegistry::new();
    registry.register(ScriptedExecutor::new(
        "reducer",
        json!({"trigger": "item_done", "item": 42}),
        log.clone(),
    ));
    let sink = ScriptedExecutor::new("sink", json!({}), log.clone());
    registry.register(sink.clone());

    let table = TransitionTable::new().add(
        Transition::new("collecting", "item_done", "collecting").emit(
            IntentTemplate::new("effect", "sink").with_payload(json!({"kind": "notify"})),
        ),
    );
    let coordinator = coordinator_with(table, "collecting", registry);

    let def = WorkflowDefinition::new("reduce-once").with_step(reduce_step("fold", "reducer"));
    let result = coordinator.process(def).await.unwrap();

    assert_eq!(result.execution_status, ExecutionStatus::Completed);
    assert_eq!(result.actions_emitted, 1);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

    // The bridged action id derives from the intent id, which derives from
    // the reduce action id (the event identity)
    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["fold-act", "act-fold-act-0"]);
    assert!(result
        .completed_steps
        .iter()
        .any(|s| s == "act-fold-act-0"));
}

/// A bridged reduce action feeds back into the machine; the loop runs until
/// a transition emits nothing.
#[tokio::test]
async fn test_feedback_loop_until_quiescence() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ExecutorRegistry::new();
    registry.register(ScriptedExecutor::new(
        "phase-one",
        json!({"trigger": "advance"}),
        log.clone(),
    ));
    registry.register(ScriptedExecutor::new(
        "phase-two",
        json!({"trigger": "finish"}),
        log.clone(),
    ));

    let table = TransitionTable::new()
        .add(
            Transition::new("start", "advance", "mid")
                .emit(IntentTemplate::new("reduce", "phase-two")),
        )
        .add(Transition::new("mid", "finish", "done"));
    let coordinator = coordinator_with(table, "start", registry);

    let def = WorkflowDefinition::new("loop").with_step(reduce_step("kick", "phase-one"));
    let result = coordinator.process(def).await.unwrap();

    assert_eq!(result.execution_status, ExecutionStatus::Completed);
    // One bridged action: the phase-two reduce; its "finish" transition emits
    // nothing, so the loop quiesces
    assert_eq!(result.actions_emitted, 1);
    let order = log.lock().unwrap().clone();
    assert_eq!(order, vec!["kick-act", "act-kick-act-0"]);
}

/// Sibling intents chained via `after` run in dependency order.
#[tokio::test]
async fn test_chained_intents_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ExecutorRegistry::new();
    registry.register(ScriptedExecutor::new(
        "reducer",
        json!({"trigger": "split"}),
        log.clone(),
    ));
    registry.register(ScriptedExecutor::new("stage", json!({}), log.clone()));

    let table = TransitionTable::new().add(
        Transition::new("start", "split", "running")
            .emit(IntentTemplate::new("effect", "stage").with_payload(json!({"n": 1})))
            .emit(
                IntentTemplate::new("effect", "stage")
                    .with_payload(json!({"n": 2}))
                    .after(0),
            ),
    );
    let coordinator = coordinator_with(table, "start", registry);

    let def = WorkflowDefinition::new("chained").with_step(reduce_step("root", "reducer"));
    let result = coordinator.process(def).await.unwrap();

    assert_eq!(result.execution_status, ExecutionStatus::Completed);
    assert_eq!(result.actions_emitted, 2);
    let order = log.lock().unwrap().clone();
    assert_eq!(
        order,
        vec!["root-act", "act-root-act-0", "act-root-act-1"],
        "the chained intent must wait for its sibling"
    );
}

/// An unmatched (status, trigger) pair is a no-op: no intents, workflow still
/// completes.
#[tokio::test]
async fn test_unmatched_trigger_emits_nothing() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = ExecutorRegistry::new();
    registry.register(ScriptedExecutor::new(
        "reducer",
        json!({"trigger": "unknown_trigger"}),
        log.clone(),
    ));

    let table =
        TransitionTable::new().add(Transition::new("start", "advance", "mid"));
    let coordinator = coordinator_with(table, "start", registry);

    let def = WorkflowDefinition::new("noop").with_step(reduce_step("only", "reducer"));
    let result = coordinator.process(def).await.unwrap();

    assert_eq!(result.execution_status, ExecutionStatus::Completed);
    assert_eq!(result.actions_emitted, 0);
    assert_eq!(result.completed_steps, vec!["only"]);
}
