//! Core data model: actions, steps, workflow definitions and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;

use crate::core::errors::{Result, WavefrontError};

pub type WorkflowId = String;
pub type StepId = String;
pub type ActionId = String;

/// What kind of work an action represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Compute,
    Effect,
    Reduce,
}

/// Lifecycle status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl Default for ActionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// A single dispatchable unit of work.
///
/// Mutation happens only through lease-validated updates; `lease_id` is
/// immutable once set and `epoch` never decreases for a given action identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: ActionId,
    pub action_type: ActionType,
    /// Capability tag naming the executor that must run this action
    pub target_node_type: String,
    pub payload: Value,
    #[serde(default)]
    pub dependencies: Vec<ActionId>,
    /// Lower runs first among ties
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ActionStatus,
}

impl Action {
    /// Create a new pending action with a generated id
    pub fn new(action_type: ActionType, target: impl Into<String>, payload: Value) -> Self {
        Self {
            action_id: cuid2::create_id(),
            action_type,
            target_node_type: target.into(),
            payload,
            dependencies: Vec::new(),
            priority: 0,
            timeout_ms: 0,
            retry_count: 0,
            lease_id: None,
            epoch: 0,
            created_at: Utc::now(),
            status: ActionStatus::Pending,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = id.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<ActionId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// A scheduling unit grouping one or more actions under a declared dependency
/// list. The step set is validated once at submission and is immutable for
/// the lifetime of that submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: StepId,
    pub step_name: String,
    pub step_type: String,
    /// Wave tie-break: lower runs first
    #[serde(default)]
    pub priority: i32,
    /// Default timeout applied to actions that leave theirs unset
    #[serde(default)]
    pub timeout_ms: u64,
    /// Default retry budget applied to actions that leave theirs unset
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    pub actions: Vec<Action>,
}

impl WorkflowStep {
    pub fn new(step_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            step_type: "task".to_string(),
            priority: 0,
            timeout_ms: 30_000,
            retry_count: 0,
            depends_on: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = step_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn depends_on(mut self, deps: Vec<StepId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// How steps within a ready wave are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Batch,
}

/// What happens to the rest of the workflow when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Abort the workflow on the first failed step
    FailFast,
    /// Fail only the dependent subtree; independent branches proceed
    ContinueOnError,
}

/// Executor-instance selection policy for batch dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSelection {
    RoundRobin,
    LeastLoaded,
}

/// Configuration for retry backoff between action attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Exponential backoff with ±10% jitter
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Fixed delay between retries
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay to wait before attempt `attempt + 1` (attempt is 1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exp = multiplier.powi(attempt.saturating_sub(1) as i32);
                let base = (*initial_delay_ms as f64 * exp).min(*max_delay_ms as f64);
                let jitter = (fastrand::u32(..) as f64 / u32::MAX as f64) * 0.2 - 0.1;
                let jittered = (base * (1.0 + jitter)).max(0.0);
                Duration::from_millis(jittered.min(*max_delay_ms as f64) as u64)
            }
            Self::Linear { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Immediate => Duration::from_millis(0),
        }
    }
}

/// Configuration for workflow execution behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub mode: ExecutionMode,
    pub failure_strategy: FailureStrategy,
    /// Maximum steps dispatched concurrently within a wave
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Workflow-level deadline; per-action timeouts still apply
    pub timeout_ms: Option<u64>,
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_batch_selection")]
    pub batch_selection: BatchSelection,
    /// Lease time-to-live; the coordinator renews at wave boundaries
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
}

fn default_max_parallel_steps() -> usize {
    3
}

fn default_batch_selection() -> BatchSelection {
    BatchSelection::LeastLoaded
}

fn default_lease_ttl_ms() -> u64 {
    60_000
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            failure_strategy: FailureStrategy::FailFast,
            max_parallel_steps: default_max_parallel_steps(),
            timeout_ms: Some(3_600_000),
            retry_strategy: RetryStrategy::default(),
            batch_selection: default_batch_selection(),
            lease_ttl_ms: default_lease_ttl_ms(),
        }
    }
}

impl WorkflowConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_steps == 0 {
            return Err(WavefrontError::validation_field(
                "max_parallel_steps must be greater than 0",
                "max_parallel_steps",
            ));
        }
        if let Some(timeout) = self.timeout_ms {
            if timeout == 0 {
                return Err(WavefrontError::validation_field(
                    "timeout_ms must be greater than 0",
                    "timeout_ms",
                ));
            }
            if timeout > 86_400_000 {
                return Err(WavefrontError::validation_field(
                    "timeout_ms cannot exceed 24 hours",
                    "timeout_ms",
                ));
            }
        }
        if self.lease_ttl_ms == 0 {
            return Err(WavefrontError::validation_field(
                "lease_ttl_ms must be greater than 0",
                "lease_ttl_ms",
            ));
        }
        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let merged = Self {
            mode: override_with.mode,
            failure_strategy: override_with.failure_strategy,
            max_parallel_steps: override_with.max_parallel_steps,
            timeout_ms: override_with.timeout_ms.or(base.timeout_ms),
            retry_strategy: override_with.retry_strategy.clone(),
            batch_selection: override_with.batch_selection,
            lease_ttl_ms: override_with.lease_ttl_ms,
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// A submitted workflow: steps plus execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub config: Option<WorkflowConfig>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow_id: cuid2::create_id(),
            name: name.into(),
            steps: Vec::new(),
            config: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = id.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Result of one executor call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Terminal and in-flight workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartialSuccess,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::PartialSuccess | Self::Cancelled
        )
    }
}

/// Why a step (or bridged root action) failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: StepId,
    /// Error category, e.g. `retry_exhausted`, `timeout`, `dependency_failed`
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// The terminal (or in-flight snapshot) outcome of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub execution_status: ExecutionStatus,
    pub completed_steps: Vec<StepId>,
    pub failed_steps: Vec<StepFailure>,
    /// Actions materialized from reducer intents during this run
    pub actions_emitted: u64,
    pub execution_time_ms: u64,
}

impl WorkflowResult {
    pub fn pending(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_status: ExecutionStatus::Pending,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            actions_emitted: 0,
            execution_time_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_action_builder_defaults() {
        let action = Action::new(ActionType::Compute, "fetcher", json!({"url": "x"}))
            .with_priority(2)
            .with_timeout_ms(500)
            .with_retries(3);
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.epoch, 0);
        assert!(action.lease_id.is_none());
        assert_eq!(action.priority, 2);
        assert_eq!(action.retry_count, 3);
        assert!(!action.action_id.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = WorkflowConfig::default();
        assert!(config.validate().is_ok());

        config.max_parallel_steps = 0;
        assert!(config.validate().is_err());

        config.max_parallel_steps = 4;
        config.timeout_ms = Some(0);
        assert!(config.validate().is_err());

        config.timeout_ms = Some(90_000_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_merge_keeps_base_timeout() {
        let base = WorkflowConfig {
            timeout_ms: Some(5_000),
            ..Default::default()
        };
        let override_with = WorkflowConfig {
            mode: ExecutionMode::Sequential,
            timeout_ms: None,
            ..Default::default()
        };
        let merged = WorkflowConfig::merge(&base, &override_with).unwrap();
        assert_eq!(merged.mode, ExecutionMode::Sequential);
        assert_eq!(merged.timeout_ms, Some(5_000));
    }

    #[test]
    fn test_exponential_backoff_grows() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        };
        // Jitter is ±10%, so attempt 3 (≈400ms) always exceeds attempt 1 (≈100ms)
        let first = strategy.delay_for(1);
        let third = strategy.delay_for(3);
        assert!(third > first, "expected {:?} > {:?}", third, first);

        // Capped at max_delay_ms
        let huge = strategy.delay_for(30);
        assert!(huge <= Duration::from_millis(10_000));
    }

    #[test]
    fn test_immediate_strategy_has_no_delay() {
        assert_eq!(RetryStrategy::Immediate.delay_for(5), Duration::from_millis(0));
        assert_eq!(
            RetryStrategy::Linear { delay_ms: 250 }.delay_for(5),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::PartialSuccess.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ActionStatus::TimedOut.is_terminal());
        assert!(!ActionStatus::Running.is_terminal());
    }
}
