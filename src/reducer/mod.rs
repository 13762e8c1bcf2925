pub mod bridge;
pub mod machine;

pub use bridge::IntentBridge;
pub use machine::{
    Intent, IntentTemplate, ReducerState, ReducerStateMachine, Transition, TransitionTable,
};
