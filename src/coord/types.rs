//! Event types flowing from dispatch workers back to the coordinator's drive
//! loop, the single place where workflow state is mutated.

use crate::workflow::types::{ActionId, ActionResult, ActionStatus, StepFailure, StepId};

/// How a single action finished after timeout/retry policy was applied
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Completed {
        result: ActionResult,
        attempts: u32,
    },
    Failed {
        kind: String,
        message: String,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

impl ActionOutcome {
    pub fn status(&self) -> ActionStatus {
        match self {
            Self::Completed { .. } => ActionStatus::Completed,
            Self::Failed { .. } => ActionStatus::Failed,
            Self::TimedOut { .. } => ActionStatus::TimedOut,
            Self::Cancelled { .. } => ActionStatus::Cancelled,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Completed { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::TimedOut { attempts }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Events emitted by step workers during wave execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ActionStarted {
        step_id: StepId,
        action_id: ActionId,
        attempt: u32,
    },
    ActionSettled {
        step_id: StepId,
        action_id: ActionId,
        outcome: ActionOutcome,
    },
    /// The step's last action settled (or an action failed and the rest of
    /// the step was abandoned)
    StepSettled {
        step_id: StepId,
        failure: Option<StepFailure>,
    },
}
