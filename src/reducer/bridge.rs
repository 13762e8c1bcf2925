//! Intent→Action bridge: converts emitted intents into new root actions that
//! feed back into the coordinator.
//!
//! Materialization is idempotent: the action id derives from the intent id,
//! so re-delivery of the same intent produces the same action identity rather
//! than a duplicate.

use chrono::Utc;
use tracing::debug;

use crate::lease::manager::Lease;
use crate::reducer::machine::Intent;
use crate::workflow::types::{Action, ActionStatus, ActionType};

/// Materializes intents into lease-stamped actions.
#[derive(Debug, Clone)]
pub struct IntentBridge {
    /// Timeout applied to bridged actions
    pub default_timeout_ms: u64,
    /// Retry budget applied to bridged actions
    pub default_retry_count: u32,
}

impl Default for IntentBridge {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            default_retry_count: 0,
        }
    }
}

impl IntentBridge {
    pub fn new(default_timeout_ms: u64, default_retry_count: u32) -> Self {
        Self {
            default_timeout_ms,
            default_retry_count,
        }
    }

    /// Deterministic action id for an intent
    pub fn action_id_for(intent_id: &str) -> String {
        format!("act-{intent_id}")
    }

    /// Materialize one intent under the workflow's active lease. The action
    /// becomes a new dependency-graph root unless chained by
    /// `materialize_all`.
    pub fn materialize(&self, intent: &Intent, lease: &Lease) -> Action {
        let action_type = match intent.intent_type.as_str() {
            "effect" => ActionType::Effect,
            "reduce" => ActionType::Reduce,
            _ => ActionType::Compute,
        };
        debug!(
            intent_id = %intent.intent_id,
            target = %intent.target,
            "materializing intent"
        );
        Action {
            action_id: Self::action_id_for(&intent.intent_id),
            action_type,
            target_node_type: intent.target.clone(),
            payload: intent.payload.clone(),
            dependencies: Vec::new(),
            priority: intent.priority,
            timeout_ms: self.default_timeout_ms,
            retry_count: self.default_retry_count,
            lease_id: Some(lease.lease_id.clone()),
            epoch: lease.epoch,
            created_at: Utc::now(),
            status: ActionStatus::Pending,
        }
    }

    /// Materialize a transition's intents together, resolving `after`
    /// ordinals into action dependencies. Ordinals outside the sibling set
    /// are ignored; an intent can only chain against intents born in the
    /// same transition.
    pub fn materialize_all(&self, intents: &[Intent], lease: &Lease) -> Vec<Action> {
        let ids: Vec<String> = intents
            .iter()
            .map(|i| Self::action_id_for(&i.intent_id))
            .collect();
        intents
            .iter()
            .enumerate()
            .map(|(i, intent)| {
                let mut action = self.materialize(intent, lease);
                action.dependencies = intent
                    .after
                    .iter()
                    .filter(|&&ord| ord < ids.len() && ord != i)
                    .map(|&ord| ids[ord].clone())
                    .collect();
                action
            })
            .collect()
    }
}
