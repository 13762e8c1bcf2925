//! Pure state-transition engine: `(state, trigger, event) -> (new_state,
//! intents)`.
//!
//! The machine performs no I/O and holds no mutable state; every side effect
//! is returned as an `Intent` for a downstream consumer to realize. Event
//! handling is idempotent by event identity: replaying the last processed
//! event id returns the state unchanged and emits nothing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// An immutable state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerState {
    /// Status tag the transition table is keyed on
    pub status: String,
    /// Domain fields, shallow-merged from event payloads
    pub fields: Value,
    pub last_processed_event_id: Option<String>,
}

impl ReducerState {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            fields: Value::Object(Map::new()),
            last_processed_event_id: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }
}

/// A deferred, declarative side-effect description emitted by a transition.
/// Consumed exactly once by the bridge, which derives the resulting action's
/// identity from `intent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub intent_type: String,
    /// Capability tag the materialized action will carry
    pub target: String,
    pub payload: Value,
    pub priority: i32,
    /// Ordinals of sibling intents (from the same transition) that must
    /// settle first; resolved to action dependencies by the bridge
    pub after: Vec<usize>,
}

/// Template instantiated with the event payload when a transition fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentTemplate {
    pub intent_type: String,
    pub target: String,
    /// Static payload base; event payload fields shallow-merge over it
    pub payload: Value,
    pub priority: i32,
    pub after: Vec<usize>,
}

impl IntentTemplate {
    pub fn new(intent_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            intent_type: intent_type.into(),
            target: target.into(),
            payload: Value::Object(Map::new()),
            priority: 0,
            after: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Chain this intent after a sibling from the same transition
    pub fn after(mut self, ordinal: usize) -> Self {
        self.after.push(ordinal);
        self
    }
}

/// One row of the transition table
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: String,
    pub trigger: String,
    pub to: String,
    pub intents: Vec<IntentTemplate>,
}

impl Transition {
    pub fn new(
        from: impl Into<String>,
        trigger: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            trigger: trigger.into(),
            to: to.into(),
            intents: Vec::new(),
        }
    }

    pub fn emit(mut self, template: IntentTemplate) -> Self {
        self.intents.push(template);
        self
    }
}

/// Externally supplied `(status, trigger) -> transition` lookup
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    transitions: HashMap<(String, String), Transition>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, transition: Transition) -> Self {
        self.transitions.insert(
            (transition.from.clone(), transition.trigger.clone()),
            transition,
        );
        self
    }

    pub fn get(&self, status: &str, trigger: &str) -> Option<&Transition> {
        self.transitions
            .get(&(status.to_string(), trigger.to_string()))
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// The reducer itself. Stateless: callers thread `ReducerState` through.
#[derive(Debug, Clone)]
pub struct ReducerStateMachine {
    table: TransitionTable,
}

impl ReducerStateMachine {
    pub fn new(table: TransitionTable) -> Self {
        Self { table }
    }

    /// Apply one event. Replaying the last processed `event_id` is a no-op;
    /// an unmatched `(status, trigger)` pair consumes the event without
    /// changing status or emitting intents.
    pub fn reduce(
        &self,
        state: &ReducerState,
        trigger: &str,
        event_id: &str,
        payload: &Value,
    ) -> (ReducerState, Vec<Intent>) {
        if state.last_processed_event_id.as_deref() == Some(event_id) {
            debug!(event_id, "duplicate event, skipping");
            return (state.clone(), Vec::new());
        }

        match self.table.get(&state.status, trigger) {
            None => {
                debug!(
                    status = %state.status,
                    trigger,
                    event_id,
                    "no transition matched, consuming event as no-op"
                );
                let mut next = state.clone();
                next.last_processed_event_id = Some(event_id.to_string());
                (next, Vec::new())
            }
            Some(transition) => {
                let mut next = state.clone();
                next.status = transition.to.clone();
                next.fields = merge_fields(&state.fields, payload);
                next.last_processed_event_id = Some(event_id.to_string());

                let intents = transition
                    .intents
                    .iter()
                    .enumerate()
                    .map(|(i, template)| Intent {
                        // Deterministic: re-delivery of the same event yields
                        // identically-identified intents
                        intent_id: format!("{event_id}-{i}"),
                        intent_type: template.intent_type.clone(),
                        target: template.target.clone(),
                        payload: merge_fields(&template.payload, payload),
                        priority: template.priority,
                        after: template.after.clone(),
                    })
                    .collect();
                debug!(
                    from = %state.status,
                    to = %next.status,
                    trigger,
                    event_id,
                    "transition applied"
                );
                (next, intents)
            }
        }
    }
}

/// Shallow merge: event object fields override the base; a non-object event
/// payload lands under an `"event"` key.
fn merge_fields(base: &Value, event: &Value) -> Value {
    match (base, event) {
        (Value::Object(b), Value::Object(e)) => {
            let mut merged = b.clone();
            for (k, v) in e {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (Value::Object(b), other) if !other.is_null() => {
            let mut merged = b.clone();
            merged.insert("event".to_string(), other.clone());
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, other) => other.clone(),
    }
}
