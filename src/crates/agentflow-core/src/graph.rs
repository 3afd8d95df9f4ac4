//! Workflow construction and validation.
//!
//! A [`WorkflowBuilder`] collects executor registrations, edges, request
//! ports and the starting executor, then [`WorkflowBuilder::build`]
//! validates the whole graph at once: unknown executor ids, duplicate
//! registrations and a missing start executor are fatal at construction and
//! never reach a run.
//!
//! # Executor references
//!
//! The surface accepts executors in two shapes, normalized to
//! `(id, input types, factory)` during construction:
//!
//! - [`ExecutorRef::Instance`] - a pre-built `Arc<dyn Executor>`, shared
//!   as-is across every run of the workflow. Registering an instance is the
//!   declaration that it is thread-safe.
//! - [`ExecutorRef::Factory`] - an id plus a factory closure; each run gets
//!   its own instance, created lazily on first delivery.
//!
//! Raw string ids appear only in edges and are resolved against the
//! registrations at build time.
//!
//! # Ownership
//!
//! A built [`Workflow`] carries a single ownership token. Starting a run
//! acquires it exclusively so two runners can never mutate shared edge
//! state; with `concurrent_runs` enabled acquisition is skipped - the edge
//! map is immutable and join accumulators live per run, so concurrent runs
//! are safe by construction.
//!
//! # Example
//!
//! ```rust,ignore
//! let workflow = WorkflowBuilder::new()
//!     .add_executor(Arc::new(Planner::new()))
//!     .add_executor(Arc::new(Solver::new()))
//!     .with_start_executor("planner")
//!     .add_edge("planner", "solver")
//!     .add_edge("solver", "planner")
//!     .build()?;
//!
//! let run = workflow.start_run(RunnerOptions::default())?;
//! run.enqueue_input(json!(0), "int")?;
//! ```

use crate::edge::{Edge, EdgeMap, EdgePredicate};
use crate::envelope::{ExecutorId, TypeTag};
use crate::error::{Result, WorkflowError};
use crate::executor::{Executor, ExecutorFactory};
use crate::handle::{RunnerOptions, WorkflowRun};
use crate::request::RequestPort;
use crate::runner::WorkflowRunner;
use agentflow_checkpoint::CheckpointStore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sum-typed reference to an executor, normalized at build time.
#[derive(Clone)]
pub enum ExecutorRef {
    /// A pre-built, shared instance (declared thread-safe).
    Instance(Arc<dyn Executor>),
    /// A per-run factory with its declared input types.
    Factory {
        /// Stable executor id.
        id: ExecutorId,
        /// Input types the produced executor accepts.
        input_types: Vec<TypeTag>,
        /// Factory invoked lazily, once per run.
        factory: ExecutorFactory,
    },
}

impl ExecutorRef {
    fn normalize(self) -> (ExecutorId, Vec<TypeTag>, ExecutorFactory) {
        match self {
            ExecutorRef::Instance(executor) => {
                let id = executor.id().to_string();
                let input_types = executor.input_types();
                let factory: ExecutorFactory = Arc::new(move || executor.clone());
                (id, input_types, factory)
            }
            ExecutorRef::Factory {
                id,
                input_types,
                factory,
            } => (id, input_types, factory),
        }
    }
}

impl fmt::Debug for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorRef::Instance(executor) => {
                f.debug_tuple("Instance").field(&executor.id()).finish()
            }
            ExecutorRef::Factory { id, .. } => f.debug_tuple("Factory").field(id).finish(),
        }
    }
}

/// Builder for a validated [`Workflow`].
#[derive(Default)]
pub struct WorkflowBuilder {
    executors: Vec<ExecutorRef>,
    edges: Vec<(Vec<ExecutorId>, Edge)>,
    ports: Vec<(RequestPort, ExecutorId)>,
    start: Option<ExecutorId>,
}

impl WorkflowBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-built executor instance, shared across runs.
    pub fn add_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(ExecutorRef::Instance(executor));
        self
    }

    /// Register a per-run executor factory.
    pub fn add_executor_factory(
        mut self,
        id: impl Into<ExecutorId>,
        input_types: Vec<TypeTag>,
        factory: ExecutorFactory,
    ) -> Self {
        self.executors.push(ExecutorRef::Factory {
            id: id.into(),
            input_types,
            factory,
        });
        self
    }

    /// Register any executor reference.
    pub fn add_executor_ref(mut self, executor: ExecutorRef) -> Self {
        self.executors.push(executor);
        self
    }

    /// Declare the executor external input is routed to.
    pub fn with_start_executor(mut self, id: impl Into<ExecutorId>) -> Self {
        self.start = Some(id.into());
        self
    }

    /// Add a direct edge accepting any payload type.
    pub fn add_edge(mut self, source: impl Into<ExecutorId>, target: impl Into<ExecutorId>) -> Self {
        let source = source.into();
        self.edges.push((vec![source], Edge::direct(target)));
        self
    }

    /// Add a direct edge restricted to one payload type.
    pub fn add_edge_for_type(
        mut self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        type_tag: impl Into<TypeTag>,
    ) -> Self {
        let source = source.into();
        self.edges
            .push((vec![source], Edge::direct(target).for_type(type_tag)));
        self
    }

    /// Add a direct typed edge that treats type mismatches as fatal.
    pub fn add_strict_edge_for_type(
        mut self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        type_tag: impl Into<TypeTag>,
    ) -> Self {
        let source = source.into();
        self.edges.push((
            vec![source],
            Edge::direct(target).for_type(type_tag).strict(),
        ));
        self
    }

    /// Add a fan-out edge delivering a copy to every target.
    pub fn add_fan_out_edge(
        mut self,
        source: impl Into<ExecutorId>,
        targets: Vec<ExecutorId>,
    ) -> Self {
        let source = source.into();
        self.edges.push((vec![source], Edge::fan_out(targets)));
        self
    }

    /// Add a fan-in join: one envelope from each source produces a single
    /// joined envelope (an array of the contributed values, in declared
    /// source order) tagged `output_tag`.
    pub fn add_fan_in_edge(
        mut self,
        sources: Vec<ExecutorId>,
        target: impl Into<ExecutorId>,
        output_tag: impl Into<TypeTag>,
    ) -> Self {
        self.edges.push((
            sources.clone(),
            Edge::fan_in(sources, target, output_tag),
        ));
        self
    }

    /// Add a conditional edge forwarding only when the predicate holds.
    pub fn add_conditional_edge<F>(
        mut self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let source = source.into();
        let predicate: EdgePredicate = Arc::new(predicate);
        self.edges
            .push((vec![source], Edge::conditional(target, predicate)));
        self
    }

    /// Declare a request port and the executor that handles its responses.
    pub fn with_request_port(
        mut self,
        port: RequestPort,
        handler: impl Into<ExecutorId>,
    ) -> Self {
        self.ports.push((port, handler.into()));
        self
    }

    /// Validate the graph and produce an immutable [`Workflow`].
    pub fn build(self) -> Result<Workflow> {
        let mut factories: HashMap<ExecutorId, ExecutorFactory> = HashMap::new();
        let mut input_types: HashMap<ExecutorId, Vec<TypeTag>> = HashMap::new();

        for reference in self.executors {
            let (id, types, factory) = reference.normalize();
            if factories.contains_key(&id) {
                return Err(WorkflowError::configuration(format!(
                    "executor '{}' registered twice",
                    id
                )));
            }
            input_types.insert(id.clone(), types);
            factories.insert(id, factory);
        }

        let start = self
            .start
            .ok_or_else(|| WorkflowError::configuration("no start executor declared"))?;
        if !factories.contains_key(&start) {
            return Err(WorkflowError::configuration(format!(
                "start executor '{}' is not registered",
                start
            )));
        }

        let known: HashSet<&ExecutorId> = factories.keys().collect();
        let mut edge_map = EdgeMap::new(start.clone());
        for (sources, edge) in self.edges {
            if sources.is_empty() {
                return Err(WorkflowError::configuration("edge with no source"));
            }
            for source in &sources {
                if !known.contains(source) {
                    return Err(WorkflowError::configuration(format!(
                        "edge source '{}' is not registered",
                        source
                    )));
                }
            }
            for target in edge_targets(&edge) {
                if !known.contains(&target) {
                    return Err(WorkflowError::configuration(format!(
                        "edge target '{}' is not registered",
                        target
                    )));
                }
            }
            edge_map.add_edge(sources, edge);
        }

        let mut seen_ports = HashSet::new();
        for (port, handler) in self.ports {
            if !seen_ports.insert(port.id.clone()) {
                return Err(WorkflowError::configuration(format!(
                    "request port '{}' declared twice",
                    port.id
                )));
            }
            if !known.contains(&handler) {
                return Err(WorkflowError::configuration(format!(
                    "port handler '{}' is not registered",
                    handler
                )));
            }
            edge_map.add_port(port, handler);
        }

        let start_input_types = input_types.remove(&start).unwrap_or_default();

        Ok(Workflow {
            edges: Arc::new(edge_map),
            factories,
            start_input_types,
            ownership: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn edge_targets(edge: &Edge) -> Vec<ExecutorId> {
    use crate::edge::EdgeKind;
    match &edge.kind {
        EdgeKind::Direct { target }
        | EdgeKind::Conditional { target, .. }
        | EdgeKind::FanIn { target, .. } => vec![target.clone()],
        EdgeKind::FanOut { targets } => targets.clone(),
    }
}

/// A validated, immutable workflow definition.
///
/// The definition is shareable: the edge map never changes after build, and
/// per-run mutable state (join buffers, executor instances, step buffers)
/// lives in each run's engine.
pub struct Workflow {
    edges: Arc<EdgeMap>,
    factories: HashMap<ExecutorId, ExecutorFactory>,
    start_input_types: Vec<TypeTag>,
    ownership: Arc<AtomicBool>,
}

impl Workflow {
    /// Start a run without checkpointing.
    pub fn start_run(&self, options: RunnerOptions) -> Result<WorkflowRun> {
        self.launch(options, None)
    }

    /// Start a run with a checkpoint store attached.
    pub fn start_run_with_store(
        &self,
        options: RunnerOptions,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<WorkflowRun> {
        self.launch(options, Some(store))
    }

    fn launch(
        &self,
        options: RunnerOptions,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<WorkflowRun> {
        if options.with_checkpointing && store.is_none() {
            return Err(WorkflowError::configuration(
                "checkpointing enabled but no checkpoint store provided",
            ));
        }

        let ownership = if options.concurrent_runs {
            None
        } else {
            if self
                .ownership
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(WorkflowError::OwnershipHeld);
            }
            Some(self.ownership.clone())
        };

        let runner = WorkflowRunner::new(
            options.clone(),
            self.edges.clone(),
            self.factories.clone(),
            store.clone(),
        );
        tracing::info!(run_id = %runner.run_id, mode = ?options.mode, "starting run");
        Ok(WorkflowRun::launch(
            runner,
            &options,
            store,
            self.start_input_types.clone(),
            ownership,
        ))
    }
}
