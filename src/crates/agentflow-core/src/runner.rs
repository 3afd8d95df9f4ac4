//! The superstep engine.
//!
//! One [`WorkflowRunner`] drives one run of a workflow through discrete
//! rounds called **supersteps**. The runner is single-owner: only it mutates
//! the step buffer, the executor cache, the join buffers and the state
//! manager. External inputs, responses, restores and end-of-run requests
//! arrive through a shared [`WorkQueue`] and are drained serially at the top
//! of every iteration (they mutate edge state, so they are never processed
//! in parallel).
//!
//! # One superstep
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  1. drain external inputs/responses (serial)           │
//! │  2. swap the pending step buffer (atomic)              │
//! │  3. deliver: group by target, lazily instantiate,      │
//! │     run handlers (parallel across targets when         │
//! │     configured, per-sender order always preserved)     │
//! │  4. merge buffered side effects serially:              │
//! │     sends → edge map → next step buffer                │
//! │  5. publish state updates (step fence)                 │
//! │  6. checkpoint (between supersteps only), then         │
//! │     SuperStepCompleted + deferred WorkflowOutput flush │
//! │  7. next-step decision:                                │
//! │     buffer non-empty → loop                            │
//! │     else → Idle / PendingRequests, emit halt signal,   │
//! │     park on the work notifier                          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Step numbering starts at 1. No envelope is delivered in the step that
//! produced it: handler sends are routed into the *pending* buffer, which
//! only becomes work after the next atomic swap.
//!
//! # Failure semantics
//!
//! A handler error becomes an `ExecutorFailed` event classified by
//! [`FailureKind`]; fatal and model failures additionally emit
//! `WorkflowError` and complete the run, recoverable ones let the step
//! finish with the other executors. Edge processing and checkpoint store
//! errors are always fatal. Cancellation is clean: buffered events flush
//! before `Completed` becomes observable.

use crate::checkpoint::ExecutorSnapshot;
use crate::context::{ContextAction, WorkflowContext};
use crate::edge::{EdgeMap, JoinState};
use crate::envelope::{Envelope, ExecutorId, SenderId};
use crate::error::{FailureKind, Result, WorkflowError};
use crate::event::{EventChannel, WorkflowEvent};
use crate::executor::{ExecutorBinding, ExecutorFactory, ExecutorHost};
use crate::handle::{RunStatus, RunnerOptions};
use crate::request::{ExternalRequest, ExternalResponse, RequestRegistry};
use crate::state::StateManager;
use crate::step::StepContext;
use agentflow_checkpoint::{CheckpointInfo, CheckpointStore, PortableJoin, WorkflowCheckpoint};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Work deposited by the run handle for the engine to drain.
pub(crate) enum ExternalWork {
    /// An external input envelope.
    Input(Envelope),
    /// A matched response, with the request the handle removed from the
    /// registry.
    Response {
        request: ExternalRequest,
        response: ExternalResponse,
    },
    /// A checkpoint to restore before resuming.
    Restore(WorkflowCheckpoint),
    /// Cooperative end-of-run.
    EndRun,
}

/// Shared deposit queue plus the wake notifier the engine parks on.
#[derive(Default)]
pub(crate) struct WorkQueue {
    queue: Mutex<VecDeque<ExternalWork>>,
    notify: Notify,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Deposit work and wake the engine.
    pub(crate) fn push(&self, work: ExternalWork) {
        self.queue
            .lock()
            .expect("work queue lock poisoned")
            .push_back(work);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ExternalWork> {
        self.queue
            .lock()
            .expect("work queue lock poisoned")
            .pop_front()
    }

    /// Park until the next deposit. A deposit that raced the park is not
    /// lost: the notifier stores a permit.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// What one lockstep tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// A superstep ran.
    Progressed,
    /// Nothing queued; the run is parked idle or pending requests.
    Idle,
    /// Nothing has been enqueued into the fresh handle yet.
    NotStarted,
    /// The run completed.
    Ended,
}

/// Everything needed to mint bound contexts off-runner (inside parallel
/// dispatch tasks).
#[derive(Clone)]
struct ContextSeed {
    state: crate::state::StateView,
    events: Arc<EventChannel>,
    requests: Arc<Mutex<RequestRegistry>>,
    halt: Arc<AtomicBool>,
    edges: Arc<EdgeMap>,
}

impl ContextSeed {
    fn context(&self, executor_id: ExecutorId, trace: BTreeMap<String, String>) -> WorkflowContext {
        WorkflowContext::new(
            executor_id,
            trace,
            self.state.clone(),
            self.events.clone(),
            self.requests.clone(),
            self.halt.clone(),
            self.edges.clone(),
        )
    }
}

/// Outcome of one handler invocation, merged serially after the barrier.
struct Invocation {
    executor_id: ExecutorId,
    actions: Vec<ContextAction>,
    failure: Option<(FailureKind, String)>,
}

/// Superstep engine for one run.
pub(crate) struct WorkflowRunner {
    pub(crate) run_id: String,
    options: RunnerOptions,
    edges: Arc<EdgeMap>,
    joins: JoinState,
    host: ExecutorHost,
    state: StateManager,
    pub(crate) requests: Arc<Mutex<RequestRegistry>>,
    pending: StepContext,
    step: u64,
    pub(crate) status: Arc<Mutex<RunStatus>>,
    pub(crate) events: Arc<EventChannel>,
    pub(crate) work: Arc<WorkQueue>,
    pub(crate) cancel: CancellationToken,
    store: Option<Arc<dyn CheckpointStore>>,
    pub(crate) checkpoints: Arc<Mutex<Vec<CheckpointInfo>>>,
    halt: Arc<AtomicBool>,
    /// Deferred `WorkflowOutput` events, flushed after the step completion
    /// event that carries them.
    outputs: Vec<(ExecutorId, Value)>,
    started: bool,
    idle_signalled: bool,
    completed: bool,
}

impl WorkflowRunner {
    pub(crate) fn new(
        options: RunnerOptions,
        edges: Arc<EdgeMap>,
        factories: HashMap<ExecutorId, ExecutorFactory>,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            options,
            edges,
            joins: JoinState::new(),
            host: ExecutorHost::new(factories),
            state: StateManager::new(),
            requests: Arc::new(Mutex::new(RequestRegistry::new())),
            pending: StepContext::new(),
            step: 0,
            status: Arc::new(Mutex::new(RunStatus::NotStarted)),
            events: Arc::new(EventChannel::new()),
            work: Arc::new(WorkQueue::new()),
            cancel: CancellationToken::new(),
            store,
            checkpoints: Arc::new(Mutex::new(Vec::new())),
            halt: Arc::new(AtomicBool::new(false)),
            outputs: Vec::new(),
            started: false,
            idle_signalled: false,
            completed: false,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed
    }

    fn seed(&self) -> ContextSeed {
        ContextSeed {
            state: self.state.view(),
            events: self.events.clone(),
            requests: self.requests.clone(),
            halt: self.halt.clone(),
            edges: self.edges.clone(),
        }
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    /// Drain every queued external deposit, serially.
    ///
    /// Returns `true` when end-of-run was requested.
    async fn drain_external(&mut self) -> Result<bool> {
        let mut end = false;
        while let Some(work) = self.work.pop() {
            match work {
                ExternalWork::Input(envelope) => {
                    self.started = true;
                    self.idle_signalled = false;
                    if let Some(mapping) = self.edges.prepare_delivery_for_input(&envelope) {
                        mapping.apply(&mut self.pending);
                    }
                }
                ExternalWork::Response { request, response } => {
                    self.started = true;
                    self.idle_signalled = false;
                    match self.edges.prepare_delivery_for_response(&request, &response) {
                        Some(mapping) => mapping.apply(&mut self.pending),
                        None => {
                            tracing::warn!(
                                port = %request.port_id,
                                "response for a port with no binding"
                            );
                            self.events.emit(WorkflowEvent::WorkflowError {
                                error: format!("no binding for request port '{}'", request.port_id),
                            });
                        }
                    }
                }
                ExternalWork::Restore(checkpoint) => {
                    self.started = true;
                    self.idle_signalled = false;
                    self.restore(checkpoint).await?;
                }
                ExternalWork::EndRun => end = true,
            }
        }
        Ok(end)
    }

    /// Execute one superstep over the swapped-out buffer.
    ///
    /// Returns `false` when the run completed inside the step (executor
    /// halt or fatal failure).
    async fn run_superstep(&mut self) -> Result<bool> {
        let current = self.pending.take();
        self.step += 1;
        let step = self.step;
        tracing::debug!(run_id = %self.run_id, step, envelopes = current.len(), "superstep start");

        // Group deliveries by target, preserving per-sender envelope order
        // and first-seen target order.
        let mut target_order: Vec<ExecutorId> = Vec::new();
        let mut per_target: HashMap<ExecutorId, Vec<Arc<Envelope>>> = HashMap::new();
        for (_, envelopes) in current.into_pairs() {
            for envelope in envelopes {
                let Some(target) = envelope.target.clone() else {
                    continue;
                };
                if !per_target.contains_key(&target) {
                    target_order.push(target.clone());
                }
                per_target.entry(target).or_default().push(envelope);
            }
        }

        // Lazy instantiation happens serially, before any dispatch; the
        // bindings then move into (possibly parallel) delivery tasks.
        let seed = self.seed();
        let mut units: Vec<(Arc<ExecutorBinding>, ExecutorId, Vec<Arc<Envelope>>)> = Vec::new();
        for target in target_order {
            let envelopes = per_target.remove(&target).unwrap_or_default();
            let init_ctx = seed.context(target.clone(), BTreeMap::new());
            let binding = self.host.ensure(&target, &init_ctx).await?;
            self.merge_actions(&target, init_ctx.take_actions())?;
            units.push((binding, target, envelopes));
        }

        let cancel = self.cancel.clone();
        let mut invocations: Vec<Invocation> = Vec::new();
        if self.options.parallel_edge_dispatch && units.len() > 1 {
            let futures: Vec<_> = units
                .into_iter()
                .map(|(binding, target, envelopes)| {
                    invoke_target(binding, target, envelopes, seed.clone(), cancel.clone())
                })
                .collect();
            for outcome in join_all(futures).await {
                invocations.extend(outcome);
            }
        } else {
            for (binding, target, envelopes) in units {
                let outcome =
                    invoke_target(binding, target, envelopes, seed.clone(), cancel.clone()).await;
                invocations.extend(outcome);
            }
        }

        // Serial merge: sends route through the edge map into the pending
        // buffer, state writes queue for publication, outputs defer.
        let mut fatal: Option<String> = None;
        for invocation in invocations {
            if let Some((kind, error)) = invocation.failure {
                if kind.is_fatal() && fatal.is_none() {
                    fatal = Some(error);
                }
                continue;
            }
            self.merge_actions(&invocation.executor_id, invocation.actions)?;
        }

        if let Some(error) = fatal {
            self.events.emit(WorkflowEvent::WorkflowError { error });
            self.complete().await;
            return Ok(false);
        }

        self.state.publish_updates();

        let checkpoint = if self.options.with_checkpointing {
            let info = self.capture_checkpoint().await?;
            self.checkpoints
                .lock()
                .expect("checkpoint list lock poisoned")
                .push(info.clone());
            Some(info)
        } else {
            None
        };

        self.events
            .emit(WorkflowEvent::SuperStepCompleted { step, checkpoint });

        for (source_id, value) in self.outputs.drain(..) {
            self.events
                .emit(WorkflowEvent::WorkflowOutput { source_id, value });
        }

        if self.halt.swap(false, Ordering::AcqRel) {
            self.events.emit(WorkflowEvent::RequestHalt);
            self.complete().await;
            return Ok(false);
        }

        Ok(true)
    }

    /// Apply an invocation's buffered side effects, in order.
    fn merge_actions(&mut self, executor_id: &ExecutorId, actions: Vec<ContextAction>) -> Result<()> {
        for action in actions {
            match action {
                ContextAction::SendMessage {
                    value,
                    type_tag,
                    target,
                } => {
                    let envelope = Arc::new(Envelope::new(
                        value,
                        type_tag,
                        SenderId::Executor(executor_id.clone()),
                    ));
                    match target {
                        Some(target) => self.pending.commit(envelope.bound_to(target)),
                        None => {
                            for mapping in
                                self.edges.deliveries_for(executor_id, &envelope, &mut self.joins)?
                            {
                                mapping.apply(&mut self.pending);
                            }
                        }
                    }
                }
                ContextAction::YieldOutput { value } => {
                    self.outputs.push((executor_id.clone(), value));
                }
                ContextAction::WriteState { scope, key, value } => {
                    self.state.queue_write(executor_id, &scope, key, value);
                }
                ContextAction::ClearScope { scope } => {
                    self.state.queue_clear_scope(executor_id, &scope);
                }
            }
        }
        Ok(())
    }

    /// Snapshot runner-owned state at the current superstep boundary.
    async fn capture_checkpoint(&mut self) -> Result<CheckpointInfo> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| WorkflowError::Execution("checkpointing enabled without a store".into()))?;

        let mut checkpoint = WorkflowCheckpoint::new(self.run_id.clone(), self.step);
        checkpoint.executors = self.host.instantiated_ids();

        let seed = self.seed();
        for id in &checkpoint.executors {
            let Some(binding) = self.host.get(id) else {
                continue;
            };
            let ctx = seed.context(id.clone(), BTreeMap::new());
            let blob = binding.executor.checkpoint_state(&ctx).await?;
            let _ = ctx.take_actions();
            let snapshot = ExecutorSnapshot {
                scopes: self.state.export(id),
                blob,
            };
            checkpoint
                .executor_state
                .insert(id.clone(), snapshot.encode()?);
        }

        checkpoint.queued_envelopes = self.pending.to_portable()?;

        // Unfinished joins: a buffered contribution must survive the
        // snapshot or the join could never fire after a restore.
        for (edge_id, source_id, envelopes) in self.joins.export() {
            let mut portable = Vec::with_capacity(envelopes.len());
            for envelope in &envelopes {
                portable.push(envelope.to_portable()?);
            }
            checkpoint.partial_joins.push(PortableJoin {
                edge_id,
                source_id,
                envelopes: portable,
            });
        }

        checkpoint.outstanding_requests = self
            .requests
            .lock()
            .expect("request registry poisoned")
            .snapshot()
            .iter()
            .map(ExternalRequest::to_portable)
            .collect::<Result<Vec<_>>>()?;

        let info = store.save(checkpoint).await?;
        tracing::debug!(
            run_id = %self.run_id,
            step = self.step,
            checkpoint_id = %info.checkpoint_id,
            "checkpoint saved"
        );
        Ok(info)
    }

    /// Apply a loaded checkpoint.
    ///
    /// Order matters: the event buffer is cleared *before* state is applied
    /// so the `RequestInfo` events the restore republishes are kept, and the
    /// halt epoch is bumped so halt signals from before the restore cannot
    /// terminate a live enumerator.
    async fn restore(&mut self, checkpoint: WorkflowCheckpoint) -> Result<()> {
        tracing::info!(
            run_id = %self.run_id,
            from_step = checkpoint.step_number,
            "restoring checkpoint"
        );

        self.events.clear_buffered();
        self.events.bump_epoch();
        self.state.clear();

        let seed = self.seed();
        for id in &checkpoint.executors {
            let init_ctx = seed.context(id.clone(), BTreeMap::new());
            let binding = self.host.ensure(id, &init_ctx).await?;
            let _ = init_ctx.take_actions();

            if let Some(bytes) = checkpoint.executor_state.get(id) {
                let snapshot = ExecutorSnapshot::decode(bytes)?;
                self.state.import(id, snapshot.scopes);
                let restore_ctx = seed.context(id.clone(), BTreeMap::new());
                binding
                    .executor
                    .restore_state(&snapshot.blob, &restore_ctx)
                    .await?;
                let _ = restore_ctx.take_actions();
            }
        }

        self.pending = StepContext::from_portable(&checkpoint.queued_envelopes)?;

        self.joins.clear();
        for join in &checkpoint.partial_joins {
            let mut envelopes = Vec::with_capacity(join.envelopes.len());
            for portable in &join.envelopes {
                envelopes.push(Arc::new(Envelope::from_portable(portable)?));
            }
            self.joins.restore(join.edge_id, join.source_id.clone(), envelopes);
        }

        {
            let mut registry = self.requests.lock().expect("request registry poisoned");
            registry.clear();
            for portable in &checkpoint.outstanding_requests {
                let request = ExternalRequest::from_portable(portable)?;
                registry.register(request.clone());
                self.events.emit(WorkflowEvent::RequestInfo { request });
            }
        }

        self.step = checkpoint.step_number;
        self.outputs.clear();
        self.halt.store(false, Ordering::Release);
        self.set_status(RunStatus::Running);
        Ok(())
    }

    /// Finish the run: clear outstanding requests, dispose executors, close
    /// the event channel so streams end after draining.
    pub(crate) async fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.set_status(RunStatus::Completed);
        self.requests
            .lock()
            .expect("request registry poisoned")
            .clear();
        self.host.dispose_all().await;
        self.events.close();
        tracing::debug!(run_id = %self.run_id, steps = self.step, "run completed");
    }

    async fn fatal(&mut self, error: WorkflowError) {
        tracing::error!(run_id = %self.run_id, error = %error, "fatal workflow error");
        self.events.emit(WorkflowEvent::WorkflowError {
            error: error.to_string(),
        });
        self.complete().await;
    }

    fn park_status(&self) -> RunStatus {
        let pending_requests = !self
            .requests
            .lock()
            .expect("request registry poisoned")
            .is_empty();
        if pending_requests {
            RunStatus::PendingRequests
        } else {
            RunStatus::Idle
        }
    }

    /// Free-running loop for streaming mode. Owns the runner until the run
    /// ends.
    pub(crate) async fn run_loop(&mut self) {
        loop {
            if self.completed {
                return;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let end = match self.drain_external().await {
                Ok(end) => end,
                Err(error) => {
                    self.fatal(error).await;
                    return;
                }
            };
            if end {
                break;
            }

            if !self.pending.is_empty() {
                self.set_status(RunStatus::Running);
                match self.run_superstep().await {
                    Ok(true) => continue,
                    Ok(false) => return,
                    Err(error) => {
                        self.fatal(error).await;
                        return;
                    }
                }
            }

            if !self.started {
                // Fresh handle: park silently until the first enqueue.
                tokio::select! {
                    _ = self.work.wait() => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            let parked = self.park_status();
            self.set_status(parked);
            // The halt signal marks a graph that went idle with nothing
            // outstanding; a run parked on pending requests stays silent
            // until the response arrives.
            if parked == RunStatus::Idle && !self.idle_signalled {
                self.idle_signalled = true;
                self.events.emit(WorkflowEvent::RequestHalt);
            }
            tokio::select! {
                _ = self.work.wait() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        self.complete().await;
    }

    /// One consumer-driven advance for lockstep mode.
    pub(crate) async fn lockstep_tick(&mut self) -> TickOutcome {
        if self.completed {
            return TickOutcome::Ended;
        }
        if self.cancel.is_cancelled() {
            self.complete().await;
            return TickOutcome::Ended;
        }

        let end = match self.drain_external().await {
            Ok(end) => end,
            Err(error) => {
                self.fatal(error).await;
                return TickOutcome::Ended;
            }
        };
        if end {
            self.complete().await;
            return TickOutcome::Ended;
        }

        if !self.pending.is_empty() {
            self.set_status(RunStatus::Running);
            return match self.run_superstep().await {
                Ok(true) => TickOutcome::Progressed,
                Ok(false) => TickOutcome::Ended,
                Err(error) => {
                    self.fatal(error).await;
                    TickOutcome::Ended
                }
            };
        }

        if !self.started {
            return TickOutcome::NotStarted;
        }

        let parked = self.park_status();
        self.set_status(parked);
        if parked == RunStatus::Idle && !self.idle_signalled {
            self.idle_signalled = true;
            self.events.emit(WorkflowEvent::RequestHalt);
        }
        TickOutcome::Idle
    }
}

/// Deliver a target's envelopes, in order, one handler call each.
///
/// Runs off-runner: everything it touches is shared through the seed.
/// Handler side effects that must stay runner-owned come back buffered in
/// the returned invocations.
async fn invoke_target(
    binding: Arc<ExecutorBinding>,
    target: ExecutorId,
    envelopes: Vec<Arc<Envelope>>,
    seed: ContextSeed,
    cancel: CancellationToken,
) -> Vec<Invocation> {
    let mut invocations = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let Some(route) = binding.routes.resolve(&envelope.type_tag) else {
            tracing::debug!(
                executor = %target,
                type_tag = %envelope.type_tag,
                "no handler for payload type"
            );
            continue;
        };

        seed.events.emit(WorkflowEvent::ExecutorInvoked {
            executor_id: target.clone(),
        });

        let ctx = seed.context(target.clone(), envelope.trace.clone());
        let result = (route.handler)(envelope.value.clone(), ctx.clone(), cancel.clone()).await;
        let mut actions = ctx.take_actions();

        match result {
            Ok(forwarded) => {
                if let Some(value) = forwarded {
                    // Implicit-successor convention: a returned value is a
                    // send along the executor's outgoing edges.
                    actions.push(ContextAction::SendMessage {
                        value,
                        type_tag: binding.output_tag.clone(),
                        target: None,
                    });
                }
                seed.events.emit(WorkflowEvent::ExecutorCompleted {
                    executor_id: target.clone(),
                });
                invocations.push(Invocation {
                    executor_id: target.clone(),
                    actions,
                    failure: None,
                });
            }
            Err(error) => {
                let kind = match &error {
                    WorkflowError::Handler { kind, .. } => *kind,
                    _ if route.recoverable => FailureKind::Recoverable,
                    _ => FailureKind::Fatal,
                };
                tracing::warn!(
                    executor = %target,
                    kind = ?kind,
                    error = %error,
                    "handler failed"
                );
                seed.events.emit(WorkflowEvent::ExecutorFailed {
                    executor_id: target.clone(),
                    kind,
                    error: error.to_string(),
                });
                // A failed invocation contributes nothing to the next step.
                invocations.push(Invocation {
                    executor_id: target.clone(),
                    actions: Vec::new(),
                    failure: Some((kind, error.to_string())),
                });
            }
        }
    }
    invocations
}
