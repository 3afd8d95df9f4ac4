//! In-memory checkpoint storage for development and testing.
//!
//! [`InMemoryCheckpointStore`] is the reference implementation of
//! [`CheckpointStore`]: all snapshots live in a thread-safe map, keyed by run
//! id, with a secondary index from checkpoint id to its position. It is the
//! store the integration tests run against and the default choice for
//! single-process embeddings that don't need durability.
//!
//! # When to use
//!
//! - Development, prototyping, unit and integration tests
//! - Single-process applications where runs are short-lived
//!
//! Avoid it when checkpoints must survive a process restart or be picked up
//! by another process; implement [`CheckpointStore`] over a database instead.
//!
//! # Example
//!
//! ```rust
//! use agentflow_checkpoint::{CheckpointStore, InMemoryCheckpointStore, WorkflowCheckpoint};
//!
//! # async fn example() -> agentflow_checkpoint::Result<()> {
//! let store = InMemoryCheckpointStore::new();
//!
//! let info = store.save(WorkflowCheckpoint::new("run-1", 1)).await?;
//! let restored = store.load(&info.checkpoint_id).await?;
//! assert!(restored.is_some());
//!
//! let history = store.list("run-1").await?;
//! assert_eq!(history.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointInfo, WorkflowCheckpoint};
use crate::error::Result;
use crate::traits::CheckpointStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Stored entry pairing a snapshot with its descriptor.
#[derive(Debug, Clone)]
struct StoredCheckpoint {
    info: CheckpointInfo,
    checkpoint: WorkflowCheckpoint,
}

#[derive(Debug, Default)]
struct Storage {
    /// run_id → checkpoints in save order.
    by_run: HashMap<String, Vec<StoredCheckpoint>>,
    /// checkpoint_id → (run_id, index into the run's vector).
    index: HashMap<String, (String, usize)>,
}

/// Thread-safe in-memory checkpoint store.
///
/// Cloning is shallow: clones share the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: Arc<RwLock<Storage>>,
}

impl InMemoryCheckpointStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of checkpoints across all runs.
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.index.len()
    }

    /// Number of distinct runs with at least one checkpoint.
    pub async fn run_count(&self) -> usize {
        self.storage.read().await.by_run.len()
    }

    /// Drop everything (useful between tests).
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        storage.by_run.clear();
        storage.index.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: WorkflowCheckpoint) -> Result<CheckpointInfo> {
        let info = CheckpointInfo {
            checkpoint_id: Uuid::new_v4().to_string(),
            run_id: checkpoint.run_id.clone(),
            step_number: checkpoint.step_number,
            created_at: Utc::now(),
        };

        let mut storage = self.storage.write().await;
        let entries = storage.by_run.entry(checkpoint.run_id.clone()).or_default();
        entries.push(StoredCheckpoint {
            info: info.clone(),
            checkpoint,
        });
        let position = entries.len() - 1;
        storage
            .index
            .insert(info.checkpoint_id.clone(), (info.run_id.clone(), position));

        Ok(info)
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>> {
        let storage = self.storage.read().await;
        let Some((run_id, position)) = storage.index.get(checkpoint_id) else {
            return Ok(None);
        };
        Ok(storage
            .by_run
            .get(run_id)
            .and_then(|entries| entries.get(*position))
            .map(|entry| entry.checkpoint.clone()))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>> {
        let storage = self.storage.read().await;
        Ok(storage
            .by_run
            .get(run_id)
            .map(|entries| entries.iter().map(|e| e.info.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        if let Some(entries) = storage.by_run.remove(run_id) {
            for entry in entries {
                storage.index.remove(&entry.info.checkpoint_id);
            }
        }
        Ok(())
    }
}
