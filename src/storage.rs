//! Snapshot persistence: the core treats storage purely as a snapshot
//! target and does not depend on any particular backend.
//!
//! A sled-backed store is provided (zstd-compressed JSON values); any other
//! technology can implement `SnapshotStore`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::core::errors::{Result, WavefrontError};
use crate::workflow::types::{Action, ExecutionStatus, WorkflowId, WorkflowStep};

/// Persisted shape per workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub steps: Vec<WorkflowStep>,
    pub actions: Vec<Action>,
    pub current_epoch: u64,
    pub status: ExecutionStatus,
}

/// Snapshot persistence capability
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()>;
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>>;
    async fn delete(&self, workflow_id: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<WorkflowId>>;
}

const ZSTD_LEVEL: i32 = 3;

/// Sled-backed snapshot store
pub struct SledSnapshotStore {
    tree: sled::Tree,
    _db: sled::Db,
}

impl SledSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("workflow_snapshots")?;
        Ok(Self { tree, _db: db })
    }

    fn encode(snapshot: &WorkflowSnapshot) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(snapshot)?;
        zstd::encode_all(&serialized[..], ZSTD_LEVEL)
            .map_err(|e| WavefrontError::storage("zstd_encode", e))
    }

    fn decode(compressed: &[u8]) -> Result<WorkflowSnapshot> {
        let bytes = zstd::decode_all(compressed)
            .map_err(|e| WavefrontError::storage("zstd_decode", e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl SnapshotStore for SledSnapshotStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let encoded = Self::encode(snapshot)?;
        self.tree.insert(snapshot.workflow_id.as_bytes(), encoded)?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| WavefrontError::storage("sled_flush", e))?;
        debug!(workflow_id = %snapshot.workflow_id, "snapshot saved");
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        match self.tree.get(workflow_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool> {
        let removed = self.tree.remove(workflow_id.as_bytes())?.is_some();
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<WorkflowId>> {
        let mut ids = Vec::new();
        for entry in self.tree.iter() {
            let (key, _) = entry?;
            ids.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(ids)
    }
}

/// In-memory store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<WorkflowId, WorkflowSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        self.snapshots
            .insert(snapshot.workflow_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        Ok(self.snapshots.get(workflow_id).map(|e| e.value().clone()))
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.snapshots.remove(workflow_id).is_some())
    }

    async fn list(&self) -> Result<Vec<WorkflowId>> {
        Ok(self.snapshots.iter().map(|e| e.key().clone()).collect())
    }
}
