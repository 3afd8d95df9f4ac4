//! Structured runtime events and the event stream coordinator.
//!
//! Everything observable about a run flows through here: executor lifecycle,
//! superstep completion, yielded outputs, external-request postings, halt
//! signalling and errors. Events are appended to a single multi-producer
//! single-consumer FIFO ([`EventChannel`]) with strictly monotonic,
//! contiguous sequence numbers per run.
//!
//! # Single enumerator
//!
//! At most one event-stream enumerator may be active per run. A second
//! concurrent [`EventChannel::take_stream`] fails with
//! `ConcurrentEnumeration`; the slot frees when the stream is dropped.
//!
//! # Halt epochs
//!
//! Halt signalling is epoch-based: each emitted event records the channel's
//! current epoch, and streams skip `RequestHalt` events whose epoch is older
//! than the current one. A checkpoint restore bumps the epoch (after
//! clearing the buffer), so halt signals queued before the restore can never
//! terminate a consumer that outlives it.
//!
//! # Two consumption modes
//!
//! - **Streaming**: [`EventChannel::take_stream`] tails the FIFO as events
//!   are produced; with `break_on_halt` the stream yields the terminal
//!   `RequestHalt` and ends, otherwise it blocks awaiting further activity.
//! - **Lockstep**: the run handle drives the engine one superstep per poll
//!   and drains the FIFO as a batch between supersteps (see the handle
//!   module); no event is observable before its superstep completes.

use crate::envelope::ExecutorId;
use crate::error::{FailureKind, Result, WorkflowError};
use crate::request::ExternalRequest;
use agentflow_checkpoint::CheckpointInfo;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A tagged runtime observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum WorkflowEvent {
    /// A handler is about to run for an executor.
    ExecutorInvoked {
        /// Executor being invoked.
        executor_id: ExecutorId,
    },

    /// A handler finished without error.
    ExecutorCompleted {
        /// Executor that completed.
        executor_id: ExecutorId,
    },

    /// A handler returned an error.
    ExecutorFailed {
        /// Executor that failed.
        executor_id: ExecutorId,
        /// Failure classification.
        kind: FailureKind,
        /// Error message.
        error: String,
    },

    /// A superstep finished; carries the checkpoint taken at its boundary
    /// when checkpointing is enabled.
    SuperStepCompleted {
        /// Step number, starting at 1.
        step: u64,
        /// Checkpoint descriptor, if one was persisted.
        checkpoint: Option<CheckpointInfo>,
    },

    /// An executor yielded a workflow-level output.
    WorkflowOutput {
        /// Executor that yielded.
        source_id: ExecutorId,
        /// Output value.
        value: Value,
    },

    /// An external request was posted and registered.
    RequestInfo {
        /// The outstanding request.
        request: ExternalRequest,
    },

    /// Terminal or pause-for-response signal.
    RequestHalt,

    /// A fatal (or reported) workflow-level error.
    WorkflowError {
        /// Error message.
        error: String,
    },

    /// User-level event emitted through the bound context.
    Custom {
        /// Executor that emitted it.
        executor_id: ExecutorId,
        /// Application data.
        data: Value,
    },
}

/// An event with its run-scoped ordering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Strictly monotonic, contiguous emission number.
    pub sequence: u64,
    /// Halt epoch the event was emitted under.
    pub epoch: u64,
    /// The observation itself.
    pub event: WorkflowEvent,
}

/// A lazy, finite sequence of event records.
pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<EventRecord>,
    sequence: u64,
    epoch: u64,
    closed: bool,
}

/// Multi-producer single-consumer FIFO with halt epochs and a
/// single-active-enumerator discipline.
#[derive(Debug, Default)]
pub struct EventChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
    enumerator_active: AtomicBool,
}

impl EventChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next sequence number.
    pub fn emit(&self, event: WorkflowEvent) -> u64 {
        let mut state = self.state.lock().expect("event channel lock poisoned");
        state.sequence += 1;
        let record = EventRecord {
            sequence: state.sequence,
            epoch: state.epoch,
            event,
        };
        tracing::trace!(sequence = record.sequence, event = ?record.event, "emit");
        state.queue.push_back(record);
        let sequence = state.sequence;
        drop(state);
        self.notify.notify_one();
        sequence
    }

    /// Pop the next buffered record without waiting.
    pub fn try_next(&self) -> Option<EventRecord> {
        self.state
            .lock()
            .expect("event channel lock poisoned")
            .queue
            .pop_front()
    }

    /// Drain every buffered record.
    pub fn drain_buffered(&self) -> Vec<EventRecord> {
        let mut state = self.state.lock().expect("event channel lock poisoned");
        state.queue.drain(..).collect()
    }

    /// Pop the next record, waiting for activity; `None` once the channel is
    /// closed and drained.
    pub async fn next(&self) -> Option<EventRecord> {
        loop {
            {
                let mut state = self.state.lock().expect("event channel lock poisoned");
                if let Some(record) = state.queue.pop_front() {
                    return Some(record);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Discard exactly the records buffered at call time.
    ///
    /// Runner-side operation used during checkpoint restore; producers are
    /// paused while it runs, so no concurrent emission can be dropped.
    pub fn clear_buffered(&self) {
        self.state
            .lock()
            .expect("event channel lock poisoned")
            .queue
            .clear();
    }

    /// The current halt epoch.
    pub fn current_epoch(&self) -> u64 {
        self.state
            .lock()
            .expect("event channel lock poisoned")
            .epoch
    }

    /// Advance the halt epoch (checkpoint restore).
    pub fn bump_epoch(&self) -> u64 {
        let mut state = self.state.lock().expect("event channel lock poisoned");
        state.epoch += 1;
        state.epoch
    }

    /// Mark the run finished: streams end once the buffer drains.
    pub fn close(&self) {
        self.state
            .lock()
            .expect("event channel lock poisoned")
            .closed = true;
        self.notify.notify_one();
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("event channel lock poisoned")
            .closed
    }

    /// Claim the single enumerator slot.
    pub fn acquire_enumerator(self: Arc<Self>) -> Result<EnumeratorGuard> {
        if self
            .enumerator_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WorkflowError::ConcurrentEnumeration);
        }
        Ok(EnumeratorGuard { channel: self })
    }

    /// Tail the channel as a stream (streaming mode).
    ///
    /// Fails with `ConcurrentEnumeration` if an enumerator is already
    /// active. With `break_on_halt` the stream yields the terminal
    /// `RequestHalt` then ends; otherwise it keeps blocking for further
    /// activity until the channel closes. Stale halt signals from earlier
    /// epochs are filtered out.
    pub fn take_stream(self: Arc<Self>, break_on_halt: bool) -> Result<EventStream> {
        let guard = self.clone().acquire_enumerator()?;
        let channel = self;
        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(record) = channel.next().await {
                if matches!(record.event, WorkflowEvent::RequestHalt) {
                    if record.epoch < channel.current_epoch() {
                        continue;
                    }
                    yield record;
                    if break_on_halt {
                        break;
                    }
                } else {
                    yield record;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Releases the enumerator slot when the consuming stream is dropped.
#[derive(Debug)]
pub struct EnumeratorGuard {
    channel: Arc<EventChannel>,
}

impl Drop for EnumeratorGuard {
    fn drop(&mut self) {
        self.channel
            .enumerator_active
            .store(false, Ordering::Release);
    }
}
