//! Error types and error handling for workflow operations.
//!
//! This module defines all errors that can occur during workflow
//! construction, coordination, and execution. All errors implement
//! `std::error::Error` via the `thiserror` crate.
//!
//! # Error Taxonomy
//!
//! ```text
//! WorkflowError
//! ├── Configuration       - Graph construction errors (fatal at build)
//! ├── UnknownRequestId    - Response without an outstanding request
//! ├── ConcurrentEnumeration - Second active event-stream enumerator
//! ├── RunEnded            - Mutation attempted after completion
//! ├── Handler             - User executor failures (classified by kind)
//! ├── Edge                - Edge processing failures (always fatal)
//! ├── Checkpoint          - Persistence errors
//! ├── Serialization       - Payload encoding errors
//! ├── Execution           - General engine errors
//! ├── OwnershipHeld       - Workflow already owned by another run
//! └── Cancelled           - Cooperative cancellation (not a failure)
//! ```
//!
//! # Propagation policy
//!
//! Recoverable handler errors become `ExecutorFailed` events and the
//! superstep continues with the remaining executors. Fatal and model errors
//! additionally produce a `WorkflowError` event and transition the run to
//! `Completed`. Protocol errors (`UnknownRequestId`, `ConcurrentEnumeration`,
//! `RunEnded`) are surfaced to the caller without terminating the run.
//! Errors never escape the public API surface except on construction and
//! disposal.
//!
//! # Example
//!
//! ```rust
//! use agentflow_core::error::{FailureKind, WorkflowError};
//!
//! fn handle(err: WorkflowError) -> String {
//!     match err {
//!         WorkflowError::UnknownRequestId(id) => {
//!             format!("no outstanding request '{}'", id)
//!         }
//!         WorkflowError::Handler { executor, kind, error } => {
//!             format!("executor '{}' failed ({:?}): {}", executor, kind, error)
//!         }
//!         _ => format!("error: {}", err),
//!     }
//! }
//! ```

use agentflow_checkpoint::CheckpointError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`WorkflowError`].
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Classification of a handler failure.
///
/// The default classification is `Fatal`; a route registered through the
/// recoverable registration path downgrades its failures to `Recoverable`.
/// `Model` marks failures originating from an underlying model call and is
/// treated like `Fatal` by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The step may continue with other executors.
    Recoverable,
    /// Terminates the run.
    Fatal,
    /// Model-originated failure; terminates the run.
    Model,
}

impl FailureKind {
    /// Whether this failure ends the run.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureKind::Fatal | FailureKind::Model)
    }
}

/// Comprehensive error type for all workflow operations.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Workflow construction failed validation.
    ///
    /// Raised while building: unknown executor ids in edges, duplicate
    /// executor registrations, duplicate route handlers, a missing start
    /// executor. Fatal at construction; the workflow is never produced.
    #[error("Workflow configuration invalid: {0}")]
    Configuration(String),

    /// A response was enqueued for a request id that is not outstanding.
    ///
    /// Protocol error: surfaced to the caller, the run continues unaffected.
    /// Also returned for the second delivery of the same response.
    #[error("Unknown request id: {0}")]
    UnknownRequestId(String),

    /// A second event-stream enumerator was requested while one is active.
    #[error("Event stream already has an active enumerator")]
    ConcurrentEnumeration,

    /// The run has completed or the handle was disposed.
    #[error("Run has already ended")]
    RunEnded,

    /// A user handler returned an error.
    #[error("Executor '{executor}' failed: {error}")]
    Handler {
        /// Executor whose handler failed.
        executor: String,
        /// Failure classification.
        kind: FailureKind,
        /// Underlying error message.
        error: String,
    },

    /// Edge processing failed. Always fatal: edge state may be inconsistent.
    #[error("Edge processing failed: {0}")]
    Edge(String),

    /// Checkpoint persistence failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Payload encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General engine error without more specific context.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The workflow's ownership token is held by another run.
    #[error("Workflow ownership already acquired by another run")]
    OwnershipHeld,

    /// The run was cancelled cooperatively. Not a failure.
    #[error("Run cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        WorkflowError::Configuration(message.into())
    }

    /// Create a handler error with an explicit classification.
    pub fn handler(
        executor: impl Into<String>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        WorkflowError::Handler {
            executor: executor.into(),
            kind,
            error: error.into(),
        }
    }

    /// The failure classification the runner applies to this error.
    ///
    /// Handler errors carry their own kind; everything else that reaches the
    /// runner mid-step defaults to `Fatal`.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WorkflowError::Handler { kind, .. } => *kind,
            _ => FailureKind::Fatal,
        }
    }
}
