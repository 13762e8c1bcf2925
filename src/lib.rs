//! Wavefront - a workflow-orchestration core.
//!
//! Accepts a declaration of interdependent steps, resolves the dependency
//! graph into execution waves, and drives execution under sequential,
//! parallel, or batch scheduling while a lease/epoch protocol guarantees
//! single-writer ownership of in-flight work. A pure reducer state machine
//! turns incoming events into new state plus deferred side-effect intents,
//! which a bridge materializes back into actions for the coordinator.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// Orchestration building blocks
pub mod coord; // coordinator, executor capability, event types
pub mod lease; // lease/epoch single-writer protocol
pub mod reducer; // pure state machine + intent bridge
pub mod storage; // snapshot persistence
pub mod workflow; // data model + dependency resolver

// Re-exports for convenience
pub use crate::core::errors::{Result, WavefrontError};

pub use coord::{
    ActionCtx, ActionOutcome, ExecutionCoordinator, ExecutorRegistry, ReducerBinding, StepExecutor,
};
pub use lease::{Lease, LeaseManager};
pub use reducer::{
    Intent, IntentBridge, IntentTemplate, ReducerState, ReducerStateMachine, Transition,
    TransitionTable,
};
pub use storage::{MemorySnapshotStore, SledSnapshotStore, SnapshotStore, WorkflowSnapshot};
pub use workflow::resolver::{DependencyGraphResolver, Wave};
pub use workflow::types::{
    Action, ActionId, ActionResult, ActionStatus, ActionType, BatchSelection, ExecutionMode,
    ExecutionStatus, FailureStrategy, RetryStrategy, StepFailure, StepId, WorkflowConfig,
    WorkflowDefinition, WorkflowId, WorkflowResult, WorkflowStep,
};
