//! Extensible checkpoint storage trait for custom backend implementations.
//!
//! This module defines **[`CheckpointStore`]** - the abstraction the workflow
//! runner persists through. The runner only ever needs three operations:
//!
//! - **`save`** - persist a snapshot, get back a descriptor with its id
//! - **`load`** - resolve a checkpoint id back to the full snapshot
//! - **`list`** - enumerate the descriptors recorded for a run
//!
//! Integrity, retention and transactional behavior are the store's concern;
//! the core requires nothing beyond read-your-writes within a single store
//! instance. Implement the trait over any backend (PostgreSQL, SQLite, Redis,
//! object storage) to make in-flight runs portable across processes.
//!
//! # Example: custom backend
//!
//! ```rust,ignore
//! use agentflow_checkpoint::{
//!     CheckpointCodec, CheckpointInfo, CheckpointStore, WorkflowCheckpoint,
//! };
//! use async_trait::async_trait;
//!
//! struct PostgresCheckpointStore {
//!     pool: sqlx::PgPool,
//!     codec: CheckpointCodec,
//! }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresCheckpointStore {
//!     async fn save(
//!         &self,
//!         checkpoint: WorkflowCheckpoint,
//!     ) -> agentflow_checkpoint::Result<CheckpointInfo> {
//!         let id = uuid::Uuid::new_v4().to_string();
//!         let bytes = self.codec.encode(&checkpoint)?;
//!         sqlx::query("INSERT INTO checkpoints (id, run_id, step, data) VALUES ($1, $2, $3, $4)")
//!             .bind(&id)
//!             .bind(&checkpoint.run_id)
//!             .bind(checkpoint.step_number as i64)
//!             .bind(&bytes)
//!             .execute(&self.pool)
//!             .await
//!             .map_err(|e| agentflow_checkpoint::CheckpointError::Store(e.to_string()))?;
//!         Ok(CheckpointInfo {
//!             checkpoint_id: id,
//!             run_id: checkpoint.run_id,
//!             step_number: checkpoint.step_number,
//!             created_at: chrono::Utc::now(),
//!         })
//!     }
//!
//!     // ... load decodes through the same codec; list follows suit ...
//! }
//! ```

use crate::checkpoint::{CheckpointInfo, WorkflowCheckpoint};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for workflow checkpoints.
///
/// Implementations must be thread-safe (`Send + Sync`); a single store
/// instance may serve several concurrent runs. `save` is called at most once
/// per superstep per run, `load` once per restore.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint and return its descriptor.
    ///
    /// The store assigns the checkpoint id; callers treat it as opaque.
    async fn save(&self, checkpoint: WorkflowCheckpoint) -> Result<CheckpointInfo>;

    /// Load a checkpoint by id, or `None` if the id is unknown.
    async fn load(&self, checkpoint_id: &str) -> Result<Option<WorkflowCheckpoint>>;

    /// List the descriptors recorded for a run, oldest first.
    async fn list(&self, run_id: &str) -> Result<Vec<CheckpointInfo>>;

    /// Delete every checkpoint recorded for a run.
    ///
    /// Optional; the default implementation is a no-op for stores with
    /// external retention policies.
    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let _ = run_id;
        Ok(())
    }
}
