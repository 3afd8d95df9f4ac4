//! # agentflow-core - Superstep Workflow Execution Engine
//!
//! A deterministic, message-passing runtime that drives a directed graph of
//! user-defined **executors** through discrete rounds called **supersteps**,
//! coordinates with external systems via request/response ports, streams
//! structured events to observers, and supports checkpoint/restore of
//! in-flight runs.
//!
//! ## Execution model
//!
//! Executors are named nodes; messages travel along typed edges (direct,
//! fan-out, fan-in/join, conditional). The runner advances the workflow one
//! superstep at a time: within a superstep, every message queued for that
//! step is delivered to its target executor; anything the handlers send
//! becomes input to the *next* step. Superstep boundaries are strict fences -
//! no message produced in step *n* is visible before step *n+1*, and scoped
//! state writes publish only when the step completes.
//!
//! ```text
//!  input ──┐
//!          ▼
//!   ┌─────────────┐  swap   ┌──────────────┐  sends   ┌─────────────┐
//!   │ pending buf │ ──────> │ superstep N  │ ───────> │ pending buf │
//!   └─────────────┘         │ (handlers)   │          │ (step N+1)  │
//!                           └──────────────┘          └─────────────┘
//!                                  │
//!                                  ▼
//!                      events: Invoked, Completed,
//!                      SuperStepCompleted(N), outputs...
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use agentflow_core::{
//!     value_handler, Executor, RouteBuilder, RunnerOptions, WorkflowBuilder,
//! };
//! use serde_json::json;
//!
//! let workflow = WorkflowBuilder::new()
//!     .add_executor(std::sync::Arc::new(Doubler))
//!     .with_start_executor("doubler")
//!     .build()?;
//!
//! let run = workflow.start_run(RunnerOptions::default())?;
//! run.enqueue_input(json!(21), "int")?;
//!
//! let mut stream = run.take_event_stream(true)?;
//! while let Some(record) = futures::StreamExt::next(&mut stream).await {
//!     println!("{:?}", record.event);
//! }
//! ```
//!
//! ## Event stream
//!
//! Every observable - executor lifecycle, superstep completion, yielded
//! outputs, external-request postings, halt signals, errors - flows through
//! a single sequence-numbered stream with two consumption modes:
//! **streaming** (events flushed as produced) and **lockstep** (the default;
//! events batched per superstep, consumer-driven). At most one enumerator
//! may be active per run, and halt signalling is epoch-based so a checkpoint
//! restore can never terminate a consumer with a stale halt.
//!
//! ## External requests
//!
//! An executor can post a request through a declared port and the run parks
//! in `PendingRequests` until the embedding application enqueues a matching
//! response, which is routed back into the graph along the port's response
//! binding. Outstanding requests survive checkpoints and are republished as
//! `RequestInfo` events on restore.
//!
//! ## Checkpointing
//!
//! With checkpointing enabled, the engine snapshots runner-owned state at
//! every superstep boundary through the `agentflow-checkpoint` store
//! abstraction: instantiated executors (with their own state blobs), queued
//! envelopes in portable form, and the outstanding-request registry. A
//! restored run reproduces the same observable event sequence given the
//! same external inputs.
//!
//! ## Module map
//!
//! - [`envelope`] - message carrier and identity types
//! - [`edge`] - edge map and delivery rules
//! - [`step`] - per-superstep message buffer
//! - [`state`] - scoped key/value store with step-fenced publication
//! - [`request`] - external request/response types and registry
//! - [`executor`] - executor trait, route tables, lazy host
//! - [`context`] - the bound context handed to handlers
//! - [`event`] - event types and the stream coordinator
//! - `runner` - the superstep engine (crate-internal)
//! - [`handle`] - the public run handle
//! - [`graph`] - workflow builder and validation
//! - [`error`] - error taxonomy

pub(crate) mod checkpoint;
pub mod context;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod handle;
pub mod request;
pub(crate) mod runner;
pub mod state;
pub mod step;

pub use context::WorkflowContext;
pub use edge::{DeliveryMapping, Edge, EdgeKind, EdgeMap, EdgePredicate, JoinState};
pub use envelope::{Envelope, ExecutorId, SenderId, TypeTag};
pub use error::{FailureKind, Result, WorkflowError};
pub use event::{EventRecord, EventStream, WorkflowEvent};
pub use executor::{
    handler, unit_handler, value_handler, Executor, ExecutorFactory, ExecutorHost, HandlerFn,
    RouteBuilder,
};
pub use graph::{ExecutorRef, Workflow, WorkflowBuilder};
pub use handle::{ExecutionMode, RunStatus, RunnerOptions, WorkflowRun};
pub use request::{ExternalRequest, ExternalResponse, RequestPort, RequestRegistry};
pub use state::{StateManager, DEFAULT_SCOPE};
pub use step::StepContext;

// Re-exported so embedders don't need a direct dependency for the common
// store types.
pub use agentflow_checkpoint::{
    CheckpointInfo, CheckpointStore, InMemoryCheckpointStore, WorkflowCheckpoint,
};
