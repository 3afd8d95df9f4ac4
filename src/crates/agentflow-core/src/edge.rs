//! Edge map: per-edge delivery rules.
//!
//! The workflow graph is intrinsically cyclic, so the topology is kept as a
//! dispatch table `source id → edges` rather than a pointer structure.
//! Executor identity is a string; per-edge state (partial join buffers)
//! lives outside the map in a [`JoinState`] owned by the runner and keyed by
//! edge id. The map itself is immutable after construction, which is what
//! lets several concurrent runs share one workflow: each run brings its own
//! join buffers.
//!
//! # Delivery preparation
//!
//! Given an envelope and its source, the map produces zero or more
//! [`DeliveryMapping`]s - commitments to write `(target, envelope)` pairs
//! into the **next** step context:
//!
//! - **Direct** edges forward a matching envelope to their single target.
//! - **Fan-out** edges bind a copy of the envelope to every target.
//! - **Fan-in** edges accumulate into the join buffer and emit one joined
//!   envelope only when every declared source has contributed.
//! - **Conditional** edges forward only when the predicate over the payload
//!   holds.
//!
//! Type matching uses the edge's declared input type: mismatches are dropped
//! silently unless the edge is marked strict, in which case edge processing
//! fails (always fatal - the join buffers may be inconsistent).
//!
//! When several edges fire from the same source they are applied in edge
//! registration order.

use crate::envelope::{Envelope, ExecutorId, SenderId, TypeTag};
use crate::error::{Result, WorkflowError};
use crate::request::{ExternalRequest, ExternalResponse, RequestPort};
use crate::step::StepContext;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Index of an edge in registration order.
pub type EdgeId = usize;

/// Predicate evaluated by conditional edges over the payload.
pub type EdgePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// The routing behavior of an edge.
#[derive(Clone)]
pub enum EdgeKind {
    /// Forward a matching envelope to a single target.
    Direct { target: ExecutorId },
    /// Deliver a copy of the envelope to several targets.
    FanOut { targets: Vec<ExecutorId> },
    /// Accumulate envelopes from multiple sources; emit one joined envelope
    /// when every declared source has contributed.
    FanIn {
        sources: Vec<ExecutorId>,
        target: ExecutorId,
        output_tag: TypeTag,
    },
    /// Forward only when the predicate over the payload holds.
    Conditional {
        target: ExecutorId,
        predicate: EdgePredicate,
    },
}

impl fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Direct { target } => f.debug_struct("Direct").field("target", target).finish(),
            EdgeKind::FanOut { targets } => {
                f.debug_struct("FanOut").field("targets", targets).finish()
            }
            EdgeKind::FanIn {
                sources, target, ..
            } => f
                .debug_struct("FanIn")
                .field("sources", sources)
                .field("target", target)
                .finish(),
            EdgeKind::Conditional { target, .. } => f
                .debug_struct("Conditional")
                .field("target", target)
                .field("predicate", &"<function>")
                .finish(),
        }
    }
}

/// A directed, typed channel linking executors.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Declared input type; `None` accepts any payload.
    pub type_tag: Option<TypeTag>,
    /// Whether a type mismatch is an error instead of a silent drop.
    pub strict: bool,
    /// Routing behavior.
    pub kind: EdgeKind,
}

impl Edge {
    /// A direct edge accepting any payload type.
    pub fn direct(target: impl Into<ExecutorId>) -> Self {
        Self {
            type_tag: None,
            strict: false,
            kind: EdgeKind::Direct {
                target: target.into(),
            },
        }
    }

    /// A fan-out edge accepting any payload type.
    pub fn fan_out(targets: Vec<ExecutorId>) -> Self {
        Self {
            type_tag: None,
            strict: false,
            kind: EdgeKind::FanOut { targets },
        }
    }

    /// A fan-in join over the given sources.
    pub fn fan_in(
        sources: Vec<ExecutorId>,
        target: impl Into<ExecutorId>,
        output_tag: impl Into<TypeTag>,
    ) -> Self {
        Self {
            type_tag: None,
            strict: false,
            kind: EdgeKind::FanIn {
                sources,
                target: target.into(),
                output_tag: output_tag.into(),
            },
        }
    }

    /// A conditional edge forwarding when the predicate holds.
    pub fn conditional(target: impl Into<ExecutorId>, predicate: EdgePredicate) -> Self {
        Self {
            type_tag: None,
            strict: false,
            kind: EdgeKind::Conditional {
                target: target.into(),
                predicate,
            },
        }
    }

    /// Restrict the edge to one declared payload type.
    pub fn for_type(mut self, type_tag: impl Into<TypeTag>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }

    /// Make type mismatches fatal instead of silent drops.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn matches(&self, envelope: &Envelope) -> Result<bool> {
        match &self.type_tag {
            None => Ok(true),
            Some(tag) if *tag == envelope.type_tag => Ok(true),
            Some(tag) => {
                if self.strict {
                    Err(WorkflowError::Edge(format!(
                        "strict edge expects type '{}', got '{}'",
                        tag, envelope.type_tag
                    )))
                } else {
                    tracing::debug!(
                        expected = %tag,
                        got = %envelope.type_tag,
                        "dropping envelope on type mismatch"
                    );
                    Ok(false)
                }
            }
        }
    }
}

/// Partial join buffers, keyed by edge id and then source.
///
/// Owned by the runner (one per run), never by the shared edge map. The
/// buffers are part of what a checkpoint must capture: a join waiting on one
/// source when the snapshot lands has to keep its buffered contributions, or
/// it could never fire after a restore. [`JoinState::export`] and
/// [`JoinState::restore`] are that boundary; the portable form lives with
/// the checkpoint types.
#[derive(Debug, Default)]
pub struct JoinState {
    buffers: HashMap<EdgeId, HashMap<ExecutorId, VecDeque<Arc<Envelope>>>>,
}

impl JoinState {
    /// Create empty join state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all partial joins.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Whether no join is holding a buffered contribution.
    pub fn is_empty(&self) -> bool {
        self.buffers
            .values()
            .all(|per_source| per_source.values().all(VecDeque::is_empty))
    }

    /// Non-empty buffered contributions in deterministic `(edge id, source)`
    /// order, each with its envelopes in arrival order.
    pub fn export(&self) -> Vec<(EdgeId, ExecutorId, Vec<Arc<Envelope>>)> {
        let mut entries: Vec<(EdgeId, ExecutorId, Vec<Arc<Envelope>>)> = Vec::new();
        for (edge_id, per_source) in &self.buffers {
            for (source, queue) in per_source {
                if queue.is_empty() {
                    continue;
                }
                entries.push((*edge_id, source.clone(), queue.iter().cloned().collect()));
            }
        }
        entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        entries
    }

    /// Append a buffered contribution (checkpoint restore).
    pub fn restore(&mut self, edge_id: EdgeId, source: ExecutorId, envelopes: Vec<Arc<Envelope>>) {
        self.buffers
            .entry(edge_id)
            .or_default()
            .entry(source)
            .or_default()
            .extend(envelopes);
    }
}

/// A commitment to write one or more `(target, envelope)` pairs into the
/// next step context.
///
/// Join-buffer mutations happen when the mapping is emitted, and the runner
/// applies every emitted mapping exactly once within the same serial
/// routing pass, so edge state and committed deliveries stay consistent.
#[derive(Debug)]
pub struct DeliveryMapping {
    writes: Vec<Arc<Envelope>>,
}

impl DeliveryMapping {
    fn new(writes: Vec<Arc<Envelope>>) -> Self {
        Self { writes }
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the mapping carries no writes.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write the pairs into the step context.
    pub fn apply(self, step: &mut StepContext) {
        for envelope in self.writes {
            step.commit(envelope);
        }
    }
}

/// Binding of a request port to the executor handling its responses.
#[derive(Debug, Clone)]
pub struct PortBinding {
    /// Port declaration.
    pub port: RequestPort,
    /// Executor that receives response envelopes.
    pub handler: ExecutorId,
}

/// Immutable dispatch table `source id → edges`, plus port bindings.
#[derive(Debug)]
pub struct EdgeMap {
    edges: Vec<Edge>,
    by_source: HashMap<ExecutorId, Vec<EdgeId>>,
    start_executor: ExecutorId,
    ports: HashMap<String, PortBinding>,
}

impl EdgeMap {
    /// Create an empty map routed at the given starting executor.
    pub(crate) fn new(start_executor: impl Into<ExecutorId>) -> Self {
        Self {
            edges: Vec::new(),
            by_source: HashMap::new(),
            start_executor: start_executor.into(),
            ports: HashMap::new(),
        }
    }

    /// Register an edge under each of its source executors.
    pub(crate) fn add_edge(&mut self, source_ids: Vec<ExecutorId>, edge: Edge) -> EdgeId {
        let id = self.edges.len();
        self.edges.push(edge);
        for source in source_ids {
            self.by_source.entry(source).or_default().push(id);
        }
        id
    }

    /// Bind a request port to its response handler.
    pub(crate) fn add_port(&mut self, port: RequestPort, handler: ExecutorId) {
        self.ports
            .insert(port.id.clone(), PortBinding { port, handler });
    }

    /// The declared starting executor for external input.
    pub fn start_executor(&self) -> &ExecutorId {
        &self.start_executor
    }

    /// Look up a port binding.
    pub fn port(&self, port_id: &str) -> Option<&PortBinding> {
        self.ports.get(port_id)
    }

    /// Every target id reachable through the edge table.
    pub fn target_ids(&self) -> Vec<ExecutorId> {
        let mut targets = Vec::new();
        for edge in &self.edges {
            match &edge.kind {
                EdgeKind::Direct { target }
                | EdgeKind::Conditional { target, .. }
                | EdgeKind::FanIn { target, .. } => targets.push(target.clone()),
                EdgeKind::FanOut { targets: many } => targets.extend(many.iter().cloned()),
            }
        }
        targets
    }

    /// Evaluate one edge against an envelope.
    ///
    /// For fan-in edges this accumulates into `joins` and emits a mapping
    /// only when the completion predicate holds (one envelope from each
    /// declared source); other kinds emit unconditionally on a type match.
    pub fn prepare_delivery_for_edge(
        &self,
        edge_id: EdgeId,
        source: &ExecutorId,
        envelope: &Arc<Envelope>,
        joins: &mut JoinState,
    ) -> Result<Option<DeliveryMapping>> {
        let edge = self
            .edges
            .get(edge_id)
            .ok_or_else(|| WorkflowError::Edge(format!("unknown edge id {}", edge_id)))?;

        if !edge.matches(envelope)? {
            return Ok(None);
        }

        match &edge.kind {
            EdgeKind::Direct { target } => {
                Ok(Some(DeliveryMapping::new(vec![envelope.bound_to(target)])))
            }
            EdgeKind::FanOut { targets } => Ok(Some(DeliveryMapping::new(
                targets.iter().map(|t| envelope.bound_to(t)).collect(),
            ))),
            EdgeKind::Conditional { target, predicate } => {
                if predicate(&envelope.value) {
                    Ok(Some(DeliveryMapping::new(vec![envelope.bound_to(target)])))
                } else {
                    Ok(None)
                }
            }
            EdgeKind::FanIn {
                sources,
                target,
                output_tag,
            } => {
                let buffer = joins.buffers.entry(edge_id).or_default();
                buffer
                    .entry(source.clone())
                    .or_default()
                    .push_back(envelope.clone());

                let complete = sources
                    .iter()
                    .all(|s| buffer.get(s).is_some_and(|q| !q.is_empty()));
                if !complete {
                    return Ok(None);
                }

                // Drain one envelope per source, in declared source order.
                let mut values = Vec::with_capacity(sources.len());
                for s in sources {
                    let contributed = buffer.get_mut(s).and_then(VecDeque::pop_front).ok_or_else(
                        || WorkflowError::Edge(format!("join buffer missing source '{}'", s)),
                    )?;
                    values.push(contributed.value.clone());
                }

                let joined = Envelope::new(
                    Value::Array(values),
                    output_tag.clone(),
                    SenderId::Executor(sources.join("+")),
                )
                .with_trace(envelope.trace.clone())
                .bound_to(target);
                Ok(Some(DeliveryMapping::new(vec![joined])))
            }
        }
    }

    /// Evaluate every edge registered for a source, in registration order.
    pub fn deliveries_for(
        &self,
        source: &ExecutorId,
        envelope: &Arc<Envelope>,
        joins: &mut JoinState,
    ) -> Result<Vec<DeliveryMapping>> {
        let Some(edge_ids) = self.by_source.get(source) else {
            return Ok(Vec::new());
        };
        let mut mappings = Vec::new();
        for &edge_id in edge_ids {
            if let Some(mapping) =
                self.prepare_delivery_for_edge(edge_id, source, envelope, joins)?
            {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// Route an external input to the starting executor (or the envelope's
    /// explicit target, when one is set).
    pub fn prepare_delivery_for_input(&self, envelope: &Envelope) -> Option<DeliveryMapping> {
        let target = envelope
            .target
            .clone()
            .unwrap_or_else(|| self.start_executor.clone());
        Some(DeliveryMapping::new(vec![envelope.bound_to(target)]))
    }

    /// Route an external response to the executor registered as the handler
    /// for the request's port.
    pub fn prepare_delivery_for_response(
        &self,
        request: &ExternalRequest,
        response: &ExternalResponse,
    ) -> Option<DeliveryMapping> {
        let binding = self.ports.get(&request.port_id)?;
        let envelope = Envelope::new(
            response.payload.clone(),
            binding.port.response_type.clone(),
            SenderId::External,
        )
        .bound_to(&binding.handler);
        Some(DeliveryMapping::new(vec![envelope]))
    }
}
