//! Bound context: the per-executor view of the runner.
//!
//! A [`WorkflowContext`] is created for every handler invocation (and once
//! for executor initialization). It exposes the side effects an executor may
//! perform - sending messages, yielding outputs, posting external requests,
//! reading and writing scoped state, emitting user events, requesting a halt
//! - without ever handing the executor a reference into runner-owned
//! structures.
//!
//! Two delivery disciplines coexist:
//!
//! - **Immediate effects** - `post_external_request` (registers the request
//!   and emits `RequestInfo` atomically), `add_event`, `request_halt` - act
//!   at call time, so observers see them between the `ExecutorInvoked` and
//!   `ExecutorCompleted` events of the invocation.
//! - **Buffered effects** - `send_message`, `yield_output`, state writes -
//!   are collected in the context and merged serially by the runner after
//!   the handler completes. Sends become input to the *next* superstep and
//!   state writes publish at the step boundary, so buffering changes nothing
//!   observable while keeping the runner the single owner of edge and step
//!   state.
//!
//! Contexts are cheap to clone and safe to move into spawned work; the
//! trace context is carried explicitly rather than through task-locals.

use crate::edge::EdgeMap;
use crate::envelope::{ExecutorId, TypeTag};
use crate::error::{Result, WorkflowError};
use crate::event::{EventChannel, WorkflowEvent};
use crate::request::{ExternalRequest, RequestRegistry};
use crate::state::{StateView, DEFAULT_SCOPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A side effect buffered for the runner's serial merge.
#[derive(Debug, Clone)]
pub(crate) enum ContextAction {
    /// Send a message along the executor's outgoing edges, or directly to an
    /// explicit target.
    SendMessage {
        value: Value,
        type_tag: TypeTag,
        target: Option<ExecutorId>,
    },
    /// Yield a workflow-level output.
    YieldOutput { value: Value },
    /// Write a scoped state value (published at step end).
    WriteState {
        scope: String,
        key: String,
        value: Value,
    },
    /// Clear a scope (published at step end).
    ClearScope { scope: String },
}

/// The bound context handed to executor handlers.
#[derive(Clone)]
pub struct WorkflowContext {
    executor_id: ExecutorId,
    trace: BTreeMap<String, String>,
    state: StateView,
    events: Arc<EventChannel>,
    requests: Arc<Mutex<RequestRegistry>>,
    halt: Arc<AtomicBool>,
    edges: Arc<EdgeMap>,
    actions: Arc<Mutex<Vec<ContextAction>>>,
}

impl WorkflowContext {
    pub(crate) fn new(
        executor_id: ExecutorId,
        trace: BTreeMap<String, String>,
        state: StateView,
        events: Arc<EventChannel>,
        requests: Arc<Mutex<RequestRegistry>>,
        halt: Arc<AtomicBool>,
        edges: Arc<EdgeMap>,
    ) -> Self {
        Self {
            executor_id,
            trace,
            state,
            events,
            requests,
            halt,
            edges,
            actions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Id of the executor this context is bound to.
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Trace context forwarded from the envelope being handled.
    pub fn trace_context(&self) -> &BTreeMap<String, String> {
        &self.trace
    }

    /// Send a message along this executor's outgoing edges.
    ///
    /// The message becomes input to the next superstep.
    pub fn send_message(&self, value: Value, type_tag: impl Into<TypeTag>) {
        self.push(ContextAction::SendMessage {
            value,
            type_tag: type_tag.into(),
            target: None,
        });
    }

    /// Send a message directly to a named executor, bypassing edge routing.
    pub fn send_message_to(
        &self,
        value: Value,
        type_tag: impl Into<TypeTag>,
        target: impl Into<ExecutorId>,
    ) {
        self.push(ContextAction::SendMessage {
            value,
            type_tag: type_tag.into(),
            target: Some(target.into()),
        });
    }

    /// Yield a workflow-level output.
    ///
    /// The `WorkflowOutput` event is flushed with the completion of the
    /// superstep that produced it.
    pub fn yield_output(&self, value: Value) {
        self.push(ContextAction::YieldOutput { value });
    }

    /// Post an external request: atomically registers it as outstanding and
    /// emits a `RequestInfo` event. Returns the request id.
    ///
    /// Fails when the request names a port the workflow never declared.
    pub fn post_external_request(&self, request: ExternalRequest) -> Result<String> {
        if self.edges.port(&request.port_id).is_none() {
            return Err(WorkflowError::configuration(format!(
                "unknown request port '{}'",
                request.port_id
            )));
        }
        let request_id = request.request_id.clone();
        {
            let mut registry = self.requests.lock().expect("request registry poisoned");
            registry.register(request.clone());
            self.events.emit(WorkflowEvent::RequestInfo { request });
        }
        tracing::debug!(
            executor = %self.executor_id,
            request_id = %request_id,
            "posted external request"
        );
        Ok(request_id)
    }

    /// Read a state value from the default scope.
    ///
    /// Reads see pre-step values: writes queued during the current superstep
    /// are invisible until the step publishes.
    pub fn read_state(&self, key: &str) -> Option<Value> {
        self.read_state_in(DEFAULT_SCOPE, key)
    }

    /// Read a state value from a named scope.
    pub fn read_state_in(&self, scope: &str, key: &str) -> Option<Value> {
        self.state.read(&self.executor_id, scope, key)
    }

    /// Write a state value into the default scope.
    pub fn write_state(&self, key: impl Into<String>, value: Value) {
        self.write_state_in(DEFAULT_SCOPE, key, value);
    }

    /// Write a state value into a named scope.
    pub fn write_state_in(&self, scope: impl Into<String>, key: impl Into<String>, value: Value) {
        self.push(ContextAction::WriteState {
            scope: scope.into(),
            key: key.into(),
            value,
        });
    }

    /// Clear the default scope.
    pub fn clear_scope(&self) {
        self.clear_scope_in(DEFAULT_SCOPE);
    }

    /// Clear a named scope.
    pub fn clear_scope_in(&self, scope: impl Into<String>) {
        self.push(ContextAction::ClearScope {
            scope: scope.into(),
        });
    }

    /// Emit a user-level event.
    pub fn add_event(&self, data: Value) {
        self.events.emit(WorkflowEvent::Custom {
            executor_id: self.executor_id.clone(),
            data,
        });
    }

    /// Request that the run halt after the current superstep.
    ///
    /// Multiple calls within a step coalesce into a single `RequestHalt`
    /// event.
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Release);
    }

    /// Drain the buffered actions for the runner's serial merge.
    pub(crate) fn take_actions(&self) -> Vec<ContextAction> {
        std::mem::take(&mut *self.actions.lock().expect("context actions poisoned"))
    }

    fn push(&self, action: ContextAction) {
        self.actions
            .lock()
            .expect("context actions poisoned")
            .push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestPort;
    use crate::state::StateManager;
    use serde_json::json;

    fn test_context(edges: EdgeMap) -> (WorkflowContext, Arc<EventChannel>, Arc<Mutex<RequestRegistry>>) {
        let events = Arc::new(EventChannel::new());
        let requests = Arc::new(Mutex::new(RequestRegistry::new()));
        let state = StateManager::new();
        let ctx = WorkflowContext::new(
            "worker".to_string(),
            BTreeMap::new(),
            state.view(),
            events.clone(),
            requests.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(edges),
        );
        (ctx, events, requests)
    }

    #[test]
    fn test_sends_are_buffered() {
        let (ctx, events, _) = test_context(EdgeMap::new("start"));
        ctx.send_message(json!(1), "int");
        ctx.yield_output(json!("done"));

        // Nothing hits the event channel until the runner merges.
        assert!(events.try_next().is_none());

        let actions = ctx.take_actions();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], ContextAction::SendMessage { .. }));
        assert!(matches!(actions[1], ContextAction::YieldOutput { .. }));

        // Draining empties the buffer.
        assert!(ctx.take_actions().is_empty());
    }

    #[test]
    fn test_post_request_registers_and_emits_atomically() {
        let mut edges = EdgeMap::new("start");
        edges.add_port(RequestPort::new("guess", "q", "a"), "worker".to_string());
        let (ctx, events, requests) = test_context(edges);

        let request = ExternalRequest::with_id("req-1", "guess", json!("number?"));
        let id = ctx.post_external_request(request).unwrap();
        assert_eq!(id, "req-1");

        assert!(requests.lock().unwrap().contains("req-1"));
        let record = events.try_next().unwrap();
        assert!(matches!(record.event, WorkflowEvent::RequestInfo { .. }));
    }

    #[test]
    fn test_post_request_unknown_port_fails() {
        let (ctx, events, requests) = test_context(EdgeMap::new("start"));
        let request = ExternalRequest::with_id("req-1", "missing", json!(null));

        assert!(matches!(
            ctx.post_external_request(request),
            Err(WorkflowError::Configuration(_))
        ));
        assert!(requests.lock().unwrap().is_empty());
        assert!(events.try_next().is_none());
    }

    #[test]
    fn test_halt_requests_coalesce() {
        let (ctx, _, _) = test_context(EdgeMap::new("start"));
        let halt = ctx.halt.clone();

        ctx.request_halt();
        ctx.request_halt();
        ctx.request_halt();

        // A single flag, not one event per call.
        assert!(halt.load(Ordering::Acquire));
        assert!(ctx.take_actions().is_empty());
    }

    #[test]
    fn test_add_event_is_immediate() {
        let (ctx, events, _) = test_context(EdgeMap::new("start"));
        ctx.add_event(json!({"progress": 0.5}));

        let record = events.try_next().unwrap();
        match record.event {
            WorkflowEvent::Custom { executor_id, data } => {
                assert_eq!(executor_id, "worker");
                assert_eq!(data, json!({"progress": 0.5}));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
