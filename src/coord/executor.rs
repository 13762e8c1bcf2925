//! Step-executor capability: the narrow `execute(action) -> result` seam the
//! core consumes from external collaborators.
//!
//! Executors are resolved from a capability-indexed registry at dispatch
//! time: a tag maps to registered trait implementations, never to string
//! matching scattered through the scheduling code. Multiple instances may be
//! registered per target; BATCH execution distributes across them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;

use crate::core::errors::{Result, WavefrontError};
use crate::workflow::types::{Action, ActionResult, BatchSelection, WorkflowId};

/// Execution context handed to an executor for one attempt.
///
/// The cancellation watch is best-effort: an in-flight call is signaled, not
/// forcibly killed, and may observe it at its own suspension points.
#[derive(Clone)]
pub struct ActionCtx {
    pub workflow_id: WorkflowId,
    pub action: Action,
    /// 1-based attempt counter
    pub attempt: u32,
    pub cancelled: watch::Receiver<bool>,
}

impl ActionCtx {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Get a payload field by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .action
            .payload
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get an optional payload field
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.action.payload.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e)
                })?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// The capability an external collaborator implements to run actions.
///
/// Executors need not retry or enforce deadlines; the coordinator applies
/// timeout and retry policy around each call.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Capability tag this executor serves (matched against
    /// `Action::target_node_type` at registration time)
    fn target(&self) -> &str;

    /// Execute one action attempt
    async fn execute(&self, ctx: &ActionCtx) -> anyhow::Result<ActionResult>;

    /// Optional: validate an action payload before dispatch
    fn validate_payload(&self, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ExecutorSlot {
    executor: Arc<dyn StepExecutor>,
    in_flight: AtomicUsize,
}

/// A selected executor instance; holding the handle counts toward the
/// instance's load until drop.
pub struct ExecutorHandle {
    slot: Arc<ExecutorSlot>,
}

impl ExecutorHandle {
    pub fn executor(&self) -> &dyn StepExecutor {
        self.slot.executor.as_ref()
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Capability-indexed registry of executor instances.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    slots: Arc<DashMap<String, Vec<Arc<ExecutorSlot>>>>,
    cursors: Arc<DashMap<String, AtomicUsize>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor instance under its capability tag. Multiple
    /// instances per tag are allowed.
    pub fn register(&self, executor: Arc<dyn StepExecutor>) {
        let target = executor.target().to_string();
        let slot = Arc::new(ExecutorSlot {
            executor,
            in_flight: AtomicUsize::new(0),
        });
        self.slots.entry(target).or_default().push(slot);
    }

    pub fn contains(&self, target: &str) -> bool {
        self.slots.get(target).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn targets(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered instances for a target
    pub fn instance_count(&self, target: &str) -> usize {
        self.slots.get(target).map(|v| v.len()).unwrap_or(0)
    }

    /// Select an instance for one action. Round-robin walks a per-target
    /// cursor; least-loaded picks the instance with the fewest handles
    /// outstanding.
    pub fn select(&self, target: &str, selection: BatchSelection) -> Result<ExecutorHandle> {
        let slots = self
            .slots
            .get(target)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WavefrontError::ExecutorNotRegistered {
                target: target.to_string(),
            })?;
        let chosen = match selection {
            BatchSelection::RoundRobin => {
                let cursor = self
                    .cursors
                    .entry(target.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                let i = cursor.fetch_add(1, Ordering::AcqRel) % slots.len();
                slots[i].clone()
            }
            BatchSelection::LeastLoaded => slots
                .iter()
                .min_by_key(|s| s.in_flight.load(Ordering::Acquire))
                .cloned()
                .expect("non-empty slot list"),
        };
        chosen.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(ExecutorHandle { slot: chosen })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ActionType;
    use serde_json::json;

    struct Echo {
        name: String,
    }

    #[async_trait]
    impl StepExecutor for Echo {
        fn target(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: &ActionCtx) -> anyhow::Result<ActionResult> {
            Ok(ActionResult::success(
                json!({"by": self.name, "input": ctx.action.payload}),
            ))
        }
    }

    fn ctx(payload: Value) -> ActionCtx {
        let (_tx, rx) = watch::channel(false);
        ActionCtx {
            workflow_id: "wf".to_string(),
            action: Action::new(ActionType::Compute, "echo", payload),
            attempt: 1,
            cancelled: rx,
        }
    }

    #[test]
    fn test_unknown_target_rejected() {
        let registry = ExecutorRegistry::new();
        let err = registry
            .select("ghost", BatchSelection::LeastLoaded)
            .err()
            .unwrap();
        assert!(matches!(err, WavefrontError::ExecutorNotRegistered { .. }));
    }

    #[test]
    fn test_round_robin_cycles_instances() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(Echo { name: "a".into() }));
        registry.register(Arc::new(Echo { name: "b".into() }));
        assert_eq!(registry.instance_count("echo"), 2);

        // Handles dropped immediately, so the cursor alone drives selection
        let mut seen = Vec::new();
        for _ in 0..4 {
            let handle = registry.select("echo", BatchSelection::RoundRobin).unwrap();
            seen.push(handle.slot.in_flight.load(Ordering::Acquire));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_least_loaded_prefers_idle_instance() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(Echo { name: "a".into() }));
        registry.register(Arc::new(Echo { name: "b".into() }));

        let first = registry.select("echo", BatchSelection::LeastLoaded).unwrap();
        let second = registry.select("echo", BatchSelection::LeastLoaded).unwrap();
        // With one handle held on each, both instances carry load 1
        assert_eq!(first.slot.in_flight.load(Ordering::Acquire), 1);
        assert_eq!(second.slot.in_flight.load(Ordering::Acquire), 1);
        assert!(!Arc::ptr_eq(&first.slot, &second.slot));

        drop(first);
        drop(second);
        let after = registry.select("echo", BatchSelection::LeastLoaded).unwrap();
        assert_eq!(after.slot.in_flight.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_ctx_input_accessors() {
        let ctx = ctx(json!({"url": "https://example.com", "limit": 3}));
        let url: String = ctx.get_input("url").unwrap();
        assert_eq!(url, "https://example.com");
        let missing: anyhow::Result<String> = ctx.get_input("nope");
        assert!(missing.is_err());
        let opt: Option<u32> = ctx.get_input_opt("limit").unwrap();
        assert_eq!(opt, Some(3));
    }
}
