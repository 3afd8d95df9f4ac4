//! Run handle and coordination surface.
//!
//! A [`WorkflowRun`] is the embedding application's view of one run:
//! enqueue input, enqueue responses, take the event stream, observe status,
//! request end-of-run, list and restore checkpoints, dispose. Every mutation
//! that deposits work wakes the engine through the shared work queue; the
//! engine only re-parks once the step buffer drains and nothing is
//! outstanding.
//!
//! # Execution modes
//!
//! - **Streaming** - the engine free-runs on a spawned task and events reach
//!   the consumer as they are produced.
//! - **Lockstep** (default) - the engine advances one superstep per poll of
//!   the event stream and yields each superstep's events as a batch; nothing
//!   is observable before its superstep completes.
//!
//! Both modes share the same engine; only the driving loop differs.

use crate::envelope::{Envelope, TypeTag};
use crate::error::{Result, WorkflowError};
use crate::event::{EventChannel, EventStream, WorkflowEvent};
use crate::request::{ExternalResponse, RequestRegistry};
use crate::runner::{ExternalWork, TickOutcome, WorkQueue, WorkflowRunner};
use agentflow_checkpoint::{CheckpointError, CheckpointInfo, CheckpointStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Fresh handle; nothing enqueued yet.
    NotStarted,
    /// Actively stepping.
    Running,
    /// Parked with an empty step buffer and no outstanding requests.
    Idle,
    /// Parked awaiting external responses.
    PendingRequests,
    /// The run has ended.
    Completed,
}

/// How the engine is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Events flushed as produced; engine free-runs on a spawned task.
    Streaming,
    /// Events batched per superstep; consumer-driven.
    #[default]
    Lockstep,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Event delivery mode.
    pub mode: ExecutionMode,
    /// Take a checkpoint at every superstep boundary. Requires a store.
    pub with_checkpointing: bool,
    /// Skip exclusive workflow ownership so several runs can share one
    /// workflow instance.
    pub concurrent_runs: bool,
    /// Run handlers for distinct targets concurrently within a step.
    pub parallel_edge_dispatch: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Lockstep,
            with_checkpointing: false,
            concurrent_runs: false,
            parallel_edge_dispatch: true,
        }
    }
}

impl RunnerOptions {
    /// Streaming event delivery.
    pub fn streaming(mut self) -> Self {
        self.mode = ExecutionMode::Streaming;
        self
    }

    /// Lockstep event delivery (the default).
    pub fn lockstep(mut self) -> Self {
        self.mode = ExecutionMode::Lockstep;
        self
    }

    /// Enable per-superstep checkpointing.
    pub fn with_checkpointing(mut self) -> Self {
        self.with_checkpointing = true;
        self
    }

    /// Allow several concurrent runs of one workflow.
    pub fn concurrent_runs(mut self) -> Self {
        self.concurrent_runs = true;
        self
    }

    /// Force sequential handler dispatch within a step.
    pub fn sequential_dispatch(mut self) -> Self {
        self.parallel_edge_dispatch = false;
        self
    }
}

enum ModeState {
    Streaming {
        task: Mutex<Option<JoinHandle<()>>>,
    },
    Lockstep {
        runner: Arc<tokio::sync::Mutex<WorkflowRunner>>,
    },
}

/// Public handle for one workflow run.
pub struct WorkflowRun {
    run_id: String,
    start_input_types: Vec<TypeTag>,
    work: Arc<WorkQueue>,
    events: Arc<EventChannel>,
    status: Arc<Mutex<RunStatus>>,
    requests: Arc<Mutex<RequestRegistry>>,
    checkpoints: Arc<Mutex<Vec<CheckpointInfo>>>,
    store: Option<Arc<dyn CheckpointStore>>,
    cancel: CancellationToken,
    mode: ModeState,
    ownership: Option<Arc<AtomicBool>>,
    disposed: AtomicBool,
}

impl WorkflowRun {
    pub(crate) fn launch(
        runner: WorkflowRunner,
        options: &RunnerOptions,
        store: Option<Arc<dyn CheckpointStore>>,
        start_input_types: Vec<TypeTag>,
        ownership: Option<Arc<AtomicBool>>,
    ) -> Self {
        let run_id = runner.run_id.clone();
        let work = runner.work.clone();
        let events = runner.events.clone();
        let status = runner.status.clone();
        let requests = runner.requests.clone();
        let checkpoints = runner.checkpoints.clone();
        let cancel = runner.cancel.clone();

        let mode = match options.mode {
            ExecutionMode::Streaming => {
                let mut runner = runner;
                let task = tokio::spawn(async move { runner.run_loop().await });
                ModeState::Streaming {
                    task: Mutex::new(Some(task)),
                }
            }
            ExecutionMode::Lockstep => ModeState::Lockstep {
                runner: Arc::new(tokio::sync::Mutex::new(runner)),
            },
        };

        Self {
            run_id,
            start_input_types,
            work,
            events,
            status,
            requests,
            checkpoints,
            store,
            cancel,
            mode,
            ownership,
            disposed: AtomicBool::new(false),
        }
    }

    /// Id of this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current run status.
    pub fn status(&self) -> RunStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) || self.status() == RunStatus::Completed {
            return Err(WorkflowError::RunEnded);
        }
        Ok(())
    }

    /// Enqueue an external input for the starting executor.
    ///
    /// Returns `false` without depositing anything when the declared type is
    /// incompatible with the starting executor's inputs.
    pub fn enqueue_input(&self, value: Value, type_tag: impl Into<TypeTag>) -> Result<bool> {
        self.ensure_live()?;
        let type_tag = type_tag.into();
        if !self.start_input_types.is_empty() && !self.start_input_types.contains(&type_tag) {
            tracing::debug!(type_tag = %type_tag, "rejecting incompatible input");
            return Ok(false);
        }
        self.work
            .push(ExternalWork::Input(Envelope::external(value, type_tag)));
        Ok(true)
    }

    /// Deliver a response for an outstanding external request.
    ///
    /// The request is removed from the registry atomically with the deposit:
    /// delivering the same response twice yields exactly one successful
    /// routing, the second call fails with `UnknownRequestId`.
    pub fn enqueue_response(&self, response: ExternalResponse) -> Result<()> {
        self.ensure_live()?;
        let request = {
            let mut registry = self.requests.lock().expect("request registry poisoned");
            registry.take(&response.request_id)
        }
        .ok_or_else(|| WorkflowError::UnknownRequestId(response.request_id.clone()))?;

        self.work.push(ExternalWork::Response { request, response });
        Ok(())
    }

    /// Take the run's event stream.
    ///
    /// At most one enumerator may be active; a concurrent second call fails
    /// with `ConcurrentEnumeration`. With `break_on_halt` the stream yields
    /// the terminal `RequestHalt` event then ends; otherwise it blocks
    /// awaiting further activity until the run completes.
    pub fn take_event_stream(&self, break_on_halt: bool) -> Result<EventStream> {
        match &self.mode {
            ModeState::Streaming { .. } => self.events.clone().take_stream(break_on_halt),
            ModeState::Lockstep { runner } => {
                self.take_lockstep_stream(runner.clone(), break_on_halt)
            }
        }
    }

    /// Lockstep mode: drive the engine one superstep per poll, yielding each
    /// superstep's events as a batch once the step has finished.
    fn take_lockstep_stream(
        &self,
        runner: Arc<tokio::sync::Mutex<WorkflowRunner>>,
        break_on_halt: bool,
    ) -> Result<EventStream> {
        let guard = self.events.clone().acquire_enumerator()?;
        let events = self.events.clone();
        let work = self.work.clone();
        let cancel = self.cancel.clone();

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                let outcome = {
                    let mut engine = runner.lock().await;
                    engine.lockstep_tick().await
                };

                let mut saw_halt = false;
                for record in events.drain_buffered() {
                    if matches!(record.event, WorkflowEvent::RequestHalt) {
                        if record.epoch < events.current_epoch() {
                            continue;
                        }
                        saw_halt = true;
                    }
                    yield record;
                }
                if saw_halt && break_on_halt {
                    break;
                }

                match outcome {
                    TickOutcome::Ended => break,
                    TickOutcome::Progressed => continue,
                    TickOutcome::Idle | TickOutcome::NotStarted => {
                        tokio::select! {
                            _ = work.wait() => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Discard the events buffered at call time (streaming mode).
    ///
    /// Events emitted afterwards are unaffected.
    pub fn clear_buffered_events(&self) {
        self.events.clear_buffered();
    }

    /// Cooperatively end the run: cancels the run's token so in-flight
    /// handlers can drain, then the engine transitions to `Completed`.
    pub fn request_end_run(&self) {
        self.cancel.cancel();
        self.work.push(ExternalWork::EndRun);
    }

    /// Descriptors of the checkpoints recorded for this run, oldest first.
    pub fn checkpoints(&self) -> Vec<CheckpointInfo> {
        self.checkpoints
            .lock()
            .expect("checkpoint list lock poisoned")
            .clone()
    }

    /// Restore a previously saved checkpoint into this run.
    ///
    /// The snapshot is loaded from the store and applied by the engine
    /// before its next superstep: executors are reinstantiated and handed
    /// their saved blobs, the step buffer is rebuilt, and every outstanding
    /// request is republished as a `RequestInfo` event.
    pub async fn restore_checkpoint(&self, info: &CheckpointInfo) -> Result<()> {
        self.ensure_live()?;
        let store = self
            .store
            .clone()
            .ok_or_else(|| WorkflowError::Execution("no checkpoint store configured".into()))?;
        let checkpoint = store
            .load(&info.checkpoint_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::Checkpoint(CheckpointError::NotFound(info.checkpoint_id.clone()))
            })?;
        self.work.push(ExternalWork::Restore(checkpoint));
        Ok(())
    }

    /// Dispose the handle: cancels the run, disposes executors, releases
    /// workflow ownership. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.work.push(ExternalWork::EndRun);

        match &self.mode {
            ModeState::Streaming { task } => {
                let handle = task.lock().expect("task handle lock poisoned").take();
                if let Some(handle) = handle {
                    let _ = handle.await;
                }
            }
            ModeState::Lockstep { runner } => {
                let mut engine = runner.lock().await;
                if !engine.is_completed() {
                    engine.complete().await;
                }
            }
        }

        if let Some(token) = &self.ownership {
            token.store(false, Ordering::Release);
        }
    }
}

impl Drop for WorkflowRun {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            if let Some(token) = &self.ownership {
                token.store(false, Ordering::Release);
            }
        }
    }
}
