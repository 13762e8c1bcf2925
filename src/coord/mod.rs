pub mod coordinator;
pub mod executor;
pub mod types;

pub use coordinator::{ExecutionCoordinator, ReducerBinding};
pub use executor::{ActionCtx, ExecutorHandle, ExecutorRegistry, StepExecutor};
pub use types::{ActionOutcome, ExecutionEvent};
