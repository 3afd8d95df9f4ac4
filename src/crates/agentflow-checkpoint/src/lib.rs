//! # agentflow-checkpoint - State Persistence for Workflow Runs
//!
//! **Trait-based checkpoint abstractions and implementations** for persisting
//! and restoring in-flight workflow runs. Checkpointing is the portability
//! boundary of the runtime: a run snapshotted here can be resumed later, or
//! in another process, with identical observable behavior.
//!
//! ## Overview
//!
//! A checkpoint is taken at a superstep boundary and captures everything the
//! runner owns:
//!
//! - **Instantiated executors** and an opaque state blob for each
//! - **Queued envelopes** for the next superstep, in portable encoded form
//! - **Outstanding external requests** awaiting responses
//!
//! ## Core concepts
//!
//! ### CheckpointStore trait
//!
//! [`CheckpointStore`] is the interface persistence backends implement:
//! `save` / `load` / `list` (plus optional `delete_run`). The core requires
//! only read-your-writes semantics within a single store instance.
//!
//! ### Portable encoding
//!
//! [`PortableEnvelope`] and [`PortableRequest`] carry payloads as encoded
//! bytes tagged with the declared type, so the store stays agnostic of
//! domain types. The encoding must round-trip for every registered type tag.
//! Stores that persist whole snapshots as bytes use [`CheckpointCodec`]: a
//! marker-framed encoding (JSON by default, bincode for compact binary
//! snapshots) whose decoder dispatches on the frame marker, so mixed-format
//! histories stay readable.
//!
//! ### Reference implementation
//!
//! [`InMemoryCheckpointStore`] keeps snapshots in a thread-safe map - ideal
//! for tests and single-process embeddings. Production backends (PostgreSQL,
//! SQLite, Redis, object storage) implement [`CheckpointStore`] themselves.
//!
//! ## Example
//!
//! ```rust
//! use agentflow_checkpoint::{CheckpointStore, InMemoryCheckpointStore, WorkflowCheckpoint};
//!
//! # async fn example() -> agentflow_checkpoint::Result<()> {
//! let store = InMemoryCheckpointStore::new();
//! let info = store.save(WorkflowCheckpoint::new("run-1", 1)).await?;
//! assert_eq!(store.list("run-1").await?.len(), 1);
//! let snapshot = store.load(&info.checkpoint_id).await?;
//! assert!(snapshot.is_some());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod memory;
pub mod traits;

pub use checkpoint::{
    CheckpointInfo, PortableEnvelope, PortableJoin, PortableRequest, WorkflowCheckpoint,
};
pub use codec::{CheckpointCodec, CheckpointEncoding};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
