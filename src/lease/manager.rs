//! Lease/epoch protocol enforcing single-writer ownership of a workflow's
//! action set.
//!
//! The `DashMap` entry guard is the serialization point: `advance` performs a
//! compare-and-swap on `(lease_id, epoch)` under the guard, so exactly one of
//! two racing updates carrying the same stale epoch wins.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::{Result, WavefrontError};
use crate::workflow::types::{Action, WorkflowId};

/// A token proving exclusive write ownership of a workflow's coordination
/// state. At most one live, non-expired lease exists per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub workflow_id: WorkflowId,
    /// Current authoritative counter; bumped on every validated mutation
    pub epoch: u64,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Lease {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.active && now < self.expires_at
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(Utc::now())
    }
}

/// Issues and validates leases; the sole arbiter of write access to action
/// state. Owned by one coordinator instance and passed explicitly, never held
/// as process-wide state.
pub struct LeaseManager {
    leases: DashMap<WorkflowId, Lease>,
    ttl: ChronoDuration,
}

impl LeaseManager {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            leases: DashMap::new(),
            ttl: ChronoDuration::milliseconds(ttl_ms as i64),
        }
    }

    /// Acquire ownership of a workflow. Fails with `LeaseHeld` if a live
    /// lease exists; an expired or released lease is replaced with a fresh
    /// one (new id, epoch restarts at 1: a new ownership history).
    pub fn acquire(&self, workflow_id: &str) -> Result<Lease> {
        let now = Utc::now();
        let mut entry = self
            .leases
            .entry(workflow_id.to_string())
            .or_insert_with(|| Lease {
                lease_id: String::new(),
                workflow_id: workflow_id.to_string(),
                epoch: 0,
                expires_at: now,
                active: false,
            });
        let lease = entry.value_mut();
        if lease.is_live_at(now) {
            return Err(WavefrontError::LeaseHeld {
                workflow_id: workflow_id.to_string(),
                lease_id: lease.lease_id.clone(),
            });
        }
        *lease = Lease {
            lease_id: cuid2::create_id(),
            workflow_id: workflow_id.to_string(),
            epoch: 1,
            expires_at: now + self.ttl,
            active: true,
        };
        debug!(workflow_id, lease_id = %lease.lease_id, "lease acquired");
        Ok(lease.clone())
    }

    /// True iff the action carries the current lease's id and epoch.
    pub fn validate(&self, workflow_id: &str, action: &Action) -> bool {
        let now = Utc::now();
        match self.leases.get(workflow_id) {
            Some(lease) => {
                lease.is_live_at(now)
                    && action.lease_id.as_deref() == Some(lease.lease_id.as_str())
                    && action.epoch == lease.epoch
            }
            None => false,
        }
    }

    /// Compare-and-swap mutation: succeeds only if the action carries the
    /// current lease id and epoch, returning the action with `epoch + 1` and
    /// the new payload; the lease epoch is bumped to match. A stale or
    /// foreign `(lease_id, epoch)` pair yields `EpochConflict` and must not
    /// be retried blindly; the caller must re-acquire ownership or abort.
    pub fn advance(&self, workflow_id: &str, action: &Action, new_payload: Value) -> Result<Action> {
        let now = Utc::now();
        let mut entry =
            self.leases
                .get_mut(workflow_id)
                .ok_or_else(|| WavefrontError::LeaseExpired {
                    workflow_id: workflow_id.to_string(),
                })?;
        let lease = entry.value_mut();
        if !lease.is_live_at(now) {
            return Err(WavefrontError::LeaseExpired {
                workflow_id: workflow_id.to_string(),
            });
        }
        if action.lease_id.as_deref() != Some(lease.lease_id.as_str())
            || action.epoch != lease.epoch
        {
            warn!(
                workflow_id,
                lease_epoch = lease.epoch,
                action_epoch = action.epoch,
                action_id = %action.action_id,
                "epoch conflict"
            );
            return Err(WavefrontError::EpochConflict {
                workflow_id: workflow_id.to_string(),
                current: lease.epoch,
                carried: action.epoch,
            });
        }
        lease.epoch += 1;
        let mut next = action.clone();
        next.epoch = lease.epoch;
        next.payload = new_payload;
        Ok(next)
    }

    /// Single-writer fast path used by the coordinator's drive loop: binds
    /// the action to the live lease's current epoch and bumps it, in one
    /// entry-guarded step. A foreign lease id still conflicts; only the
    /// holder of the live lease can take this path.
    pub fn advance_owned(
        &self,
        workflow_id: &str,
        action: &Action,
        new_payload: Value,
    ) -> Result<Action> {
        let now = Utc::now();
        let mut entry =
            self.leases
                .get_mut(workflow_id)
                .ok_or_else(|| WavefrontError::LeaseExpired {
                    workflow_id: workflow_id.to_string(),
                })?;
        let lease = entry.value_mut();
        if !lease.is_live_at(now) {
            return Err(WavefrontError::LeaseExpired {
                workflow_id: workflow_id.to_string(),
            });
        }
        if let Some(id) = action.lease_id.as_deref() {
            if id != lease.lease_id {
                return Err(WavefrontError::EpochConflict {
                    workflow_id: workflow_id.to_string(),
                    current: lease.epoch,
                    carried: action.epoch,
                });
            }
        }
        lease.epoch += 1;
        let mut next = action.clone();
        next.lease_id = Some(lease.lease_id.clone());
        next.epoch = lease.epoch;
        next.payload = new_payload;
        Ok(next)
    }

    /// Stamp a freshly created action with the live lease without bumping the
    /// epoch. `lease_id` is immutable once set, so stamping an already-leased
    /// action under a different lease fails.
    pub fn stamp(&self, workflow_id: &str, action: &mut Action) -> Result<()> {
        let now = Utc::now();
        let entry = self
            .leases
            .get(workflow_id)
            .ok_or_else(|| WavefrontError::LeaseExpired {
                workflow_id: workflow_id.to_string(),
            })?;
        let lease = entry.value();
        if !lease.is_live_at(now) {
            return Err(WavefrontError::LeaseExpired {
                workflow_id: workflow_id.to_string(),
            });
        }
        match action.lease_id.as_deref() {
            None => {
                action.lease_id = Some(lease.lease_id.clone());
                action.epoch = lease.epoch;
                Ok(())
            }
            Some(id) if id == lease.lease_id => {
                action.epoch = lease.epoch;
                Ok(())
            }
            Some(_) => Err(WavefrontError::EpochConflict {
                workflow_id: workflow_id.to_string(),
                current: lease.epoch,
                carried: action.epoch,
            }),
        }
    }

    /// Extend the lease's expiry. Fails once the lease has expired or been
    /// released; ownership cannot be resurrected, only re-acquired.
    pub fn renew(&self, lease: &Lease) -> Result<Lease> {
        let now = Utc::now();
        let mut entry = self.leases.get_mut(&lease.workflow_id).ok_or_else(|| {
            WavefrontError::LeaseExpired {
                workflow_id: lease.workflow_id.clone(),
            }
        })?;
        let current = entry.value_mut();
        if !current.is_live_at(now) || current.lease_id != lease.lease_id {
            return Err(WavefrontError::LeaseExpired {
                workflow_id: lease.workflow_id.clone(),
            });
        }
        current.expires_at = now + self.ttl;
        Ok(current.clone())
    }

    /// Mark the lease inactive; subsequent validates against it always fail.
    pub fn release(&self, lease: &Lease) {
        if let Some(mut entry) = self.leases.get_mut(&lease.workflow_id) {
            let current = entry.value_mut();
            if current.lease_id == lease.lease_id {
                current.active = false;
                debug!(workflow_id = %lease.workflow_id, lease_id = %lease.lease_id, "lease released");
            }
        }
    }

    /// Snapshot of the current lease for a workflow, live or not.
    pub fn current(&self, workflow_id: &str) -> Option<Lease> {
        self.leases.get(workflow_id).map(|e| e.value().clone())
    }
}
