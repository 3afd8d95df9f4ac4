//! Executor interface, route tables and the lazy executor host.
//!
//! An **executor** is a named processing node in the graph. Implementations
//! declare the payload types they accept, register typed handlers through a
//! [`RouteBuilder`], and optionally participate in checkpointing through the
//! state hooks. The runner instantiates executors lazily on first delivery,
//! caches them for the lifetime of the run, initializes them once, and
//! disposes them at run end.
//!
//! # Handler shape
//!
//! Handlers differ in arity and return kind, but internally every route is a
//! single shape: `(value, bound context, cancel) → future of
//! Result<Option<Value>>`. The adapter constructors ([`handler`],
//! [`value_handler`], [`unit_handler`]) wrap user-shaped closures into that
//! shape at registration time. A handler that resolves to `Some(value)` has
//! its result forwarded as a send along the executor's outgoing edges, the
//! implicit-successor convention.
//!
//! # Dispatch
//!
//! Route resolution is by declared type tag; a single **catch-all** handler
//! may be registered and is consulted only when no typed handler matches.
//! Registering two handlers for one type without the explicit override path
//! is a configuration error.

use crate::context::WorkflowContext;
use crate::envelope::{ExecutorId, TypeTag};
use crate::error::{Result, WorkflowError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The single internal handler shape every route is adapted into.
pub type HandlerFn = Arc<
    dyn Fn(
            Value,
            WorkflowContext,
            CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>
        + Send
        + Sync,
>;

/// Factory producing a fresh executor instance for a run.
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn Executor> + Send + Sync>;

/// Adapt a canonical-shaped closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Value, WorkflowContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(move |value, ctx, cancel| Box::pin(f(value, ctx, cancel)))
}

/// Adapt a value-returning closure: its result is forwarded to the implicit
/// successor edges.
pub fn value_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Value, WorkflowContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |value, ctx, cancel| {
        let fut = f(value, ctx, cancel);
        Box::pin(async move { fut.await.map(Some) })
    })
}

/// Adapt a side-effect-only closure that does not observe the cancel token.
pub fn unit_handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Value, WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |value, ctx, _cancel| {
        let fut = f(value, ctx);
        Box::pin(async move { fut.await.map(|()| None) })
    })
}

/// A registered route with its failure classification.
#[derive(Clone)]
pub struct RouteEntry {
    /// The adapted handler.
    pub handler: HandlerFn,
    /// Whether failures of this route let the step continue.
    pub recoverable: bool,
}

/// Builder executors register their routes against.
#[derive(Default)]
pub struct RouteBuilder {
    routes: HashMap<TypeTag, RouteEntry>,
    catch_all: Option<RouteEntry>,
}

impl RouteBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler. Failures are classified fatal.
    pub fn on(&mut self, type_tag: impl Into<TypeTag>, handler: HandlerFn) -> Result<&mut Self> {
        self.insert(type_tag.into(), handler, false, false)
    }

    /// Register a typed handler whose failures are recoverable.
    pub fn on_recoverable(
        &mut self,
        type_tag: impl Into<TypeTag>,
        handler: HandlerFn,
    ) -> Result<&mut Self> {
        self.insert(type_tag.into(), handler, true, false)
    }

    /// Replace a previously registered handler. The explicit override path:
    /// without it, duplicate registration is an error.
    pub fn override_route(
        &mut self,
        type_tag: impl Into<TypeTag>,
        handler: HandlerFn,
    ) -> &mut Self {
        let _ = self.insert(type_tag.into(), handler, false, true);
        self
    }

    /// Register the catch-all handler, consulted only when no typed handler
    /// matches. At most one may be registered.
    pub fn catch_all(&mut self, handler: HandlerFn) -> Result<&mut Self> {
        if self.catch_all.is_some() {
            return Err(WorkflowError::configuration(
                "catch-all handler already registered",
            ));
        }
        self.catch_all = Some(RouteEntry {
            handler,
            recoverable: false,
        });
        Ok(self)
    }

    fn insert(
        &mut self,
        type_tag: TypeTag,
        handler: HandlerFn,
        recoverable: bool,
        overriding: bool,
    ) -> Result<&mut Self> {
        if !overriding && self.routes.contains_key(&type_tag) {
            return Err(WorkflowError::configuration(format!(
                "handler for type '{}' already registered",
                type_tag
            )));
        }
        self.routes.insert(
            type_tag,
            RouteEntry {
                handler,
                recoverable,
            },
        );
        Ok(self)
    }

    pub(crate) fn finish(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
            catch_all: self.catch_all,
        }
    }
}

/// Immutable per-executor dispatch table.
pub struct RouteTable {
    routes: HashMap<TypeTag, RouteEntry>,
    catch_all: Option<RouteEntry>,
}

impl RouteTable {
    /// Resolve the handler for a payload type: typed route first, then the
    /// catch-all.
    pub fn resolve(&self, type_tag: &str) -> Option<&RouteEntry> {
        self.routes.get(type_tag).or(self.catch_all.as_ref())
    }

    /// Whether any route exists for the type.
    pub fn handles(&self, type_tag: &str) -> bool {
        self.resolve(type_tag).is_some()
    }
}

/// A registered processing unit in the graph.
///
/// Instances that hold mutable run state use interior mutability; the host
/// shares executors as `Arc<dyn Executor>` and handlers may run concurrently
/// with other executors' handlers in the same superstep. An executor is only
/// shared across concurrent runs when it is registered as a pre-built
/// instance (the declaration of thread-safety); factory-registered executors
/// are instantiated once per run.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable identifier of this executor.
    fn id(&self) -> &str;

    /// Payload types this executor accepts.
    fn input_types(&self) -> Vec<TypeTag>;

    /// Payload types this executor produces. The first entry tags results
    /// forwarded from value-returning handlers.
    fn output_types(&self) -> Vec<TypeTag> {
        Vec::new()
    }

    /// Register typed handlers and an optional catch-all.
    fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()>;

    /// One-time initialization, run on first instantiation.
    async fn initialize(&self, _ctx: &WorkflowContext) -> Result<()> {
        Ok(())
    }

    /// Produce a serialized state blob for a checkpoint.
    async fn checkpoint_state(&self, _ctx: &WorkflowContext) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Restore state from a checkpoint blob.
    async fn restore_state(&self, _blob: &[u8], _ctx: &WorkflowContext) -> Result<()> {
        Ok(())
    }

    /// Release resources at run end.
    async fn dispose(&self) {}
}

/// An instantiated executor with its dispatch table.
pub struct ExecutorBinding {
    /// The executor instance.
    pub executor: Arc<dyn Executor>,
    /// Its resolved route table.
    pub routes: RouteTable,
    /// Tag applied to forwarded handler results.
    pub output_tag: TypeTag,
}

/// Lazy, memoizing executor cache for one run.
///
/// Mutated only by the runner; bindings are handed out as `Arc` clones for
/// the duration of a superstep.
pub struct ExecutorHost {
    factories: HashMap<ExecutorId, ExecutorFactory>,
    instances: HashMap<ExecutorId, Arc<ExecutorBinding>>,
    order: Vec<ExecutorId>,
}

impl ExecutorHost {
    /// Create a host over the workflow's registered factories.
    pub fn new(factories: HashMap<ExecutorId, ExecutorFactory>) -> Self {
        Self {
            factories,
            instances: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Whether an executor id is registered (instantiated or not).
    pub fn knows(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Whether an executor has been instantiated.
    pub fn is_instantiated(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Memoized factory call: the first call for an id creates the instance,
    /// builds its route table and runs one-time initialization against the
    /// provided bound context.
    pub async fn ensure(
        &mut self,
        id: &str,
        init_ctx: &WorkflowContext,
    ) -> Result<Arc<ExecutorBinding>> {
        if let Some(binding) = self.instances.get(id) {
            return Ok(binding.clone());
        }

        let factory = self.factories.get(id).ok_or_else(|| {
            WorkflowError::configuration(format!("unknown executor '{}'", id))
        })?;
        let executor = factory();

        let mut builder = RouteBuilder::new();
        executor.configure_routes(&mut builder)?;
        executor.initialize(init_ctx).await?;

        let output_tag = executor
            .output_types()
            .into_iter()
            .next()
            .unwrap_or_else(|| "message".to_string());

        tracing::debug!(executor = %id, "instantiated executor");
        let binding = Arc::new(ExecutorBinding {
            executor,
            routes: builder.finish(),
            output_tag,
        });
        self.instances.insert(id.to_string(), binding.clone());
        self.order.push(id.to_string());
        Ok(binding)
    }

    /// Look up an instantiated executor.
    pub fn get(&self, id: &str) -> Option<Arc<ExecutorBinding>> {
        self.instances.get(id).cloned()
    }

    /// Ids of instantiated executors, in instantiation order.
    pub fn instantiated_ids(&self) -> Vec<ExecutorId> {
        self.order.clone()
    }

    /// Dispose every instantiated executor and drop the cache.
    pub async fn dispose_all(&mut self) {
        for id in self.order.drain(..) {
            if let Some(binding) = self.instances.remove(&id) {
                binding.executor.dispose().await;
            }
        }
        self.instances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeMap;
    use crate::event::EventChannel;
    use crate::request::RequestRegistry;
    use crate::state::StateManager;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_ctx() -> WorkflowContext {
        WorkflowContext::new(
            "test".to_string(),
            BTreeMap::new(),
            StateManager::new().view(),
            Arc::new(EventChannel::new()),
            Arc::new(Mutex::new(RequestRegistry::new())),
            Arc::new(AtomicBool::new(false)),
            Arc::new(EdgeMap::new("start")),
        )
    }

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn input_types(&self) -> Vec<TypeTag> {
            vec!["text".to_string()]
        }

        fn output_types(&self) -> Vec<TypeTag> {
            vec!["text".to_string()]
        }

        fn configure_routes(&self, routes: &mut RouteBuilder) -> Result<()> {
            routes.on(
                "text",
                value_handler(|value, _ctx, _cancel| async move { Ok(value) }),
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_route_is_error() {
        let mut builder = RouteBuilder::new();
        builder
            .on("text", unit_handler(|_, _| async { Ok(()) }))
            .unwrap();
        let result = builder.on("text", unit_handler(|_, _| async { Ok(()) }));
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_override_route_replaces() {
        let mut builder = RouteBuilder::new();
        builder
            .on("text", unit_handler(|_, _| async { Ok(()) }))
            .unwrap();
        builder.override_route(
            "text",
            value_handler(|_, _, _| async { Ok(json!("replaced")) }),
        );
        let table = builder.finish();
        assert!(table.handles("text"));
    }

    #[test]
    fn test_second_catch_all_is_error() {
        let mut builder = RouteBuilder::new();
        builder
            .catch_all(unit_handler(|_, _| async { Ok(()) }))
            .unwrap();
        let result = builder.catch_all(unit_handler(|_, _| async { Ok(()) }));
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_catch_all_resolves_only_on_miss() {
        let mut builder = RouteBuilder::new();
        builder
            .on(
                "typed",
                value_handler(|_, _, _| async { Ok(json!("typed")) }),
            )
            .unwrap();
        builder
            .catch_all(value_handler(|_, _, _| async { Ok(json!("fallback")) }))
            .unwrap();
        let table = builder.finish();

        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        let typed = table.resolve("typed").unwrap();
        let out = (typed.handler)(json!(null), ctx.clone(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(out, Some(json!("typed")));

        let fallback = table.resolve("anything-else").unwrap();
        let out = (fallback.handler)(json!(null), ctx, cancel).await.unwrap();
        assert_eq!(out, Some(json!("fallback")));
    }

    #[tokio::test]
    async fn test_host_is_lazy_and_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();
        let factory: ExecutorFactory = Arc::new(move || {
            calls_in_factory.fetch_add(1, Ordering::SeqCst);
            Arc::new(Echo)
        });

        let mut factories = HashMap::new();
        factories.insert("echo".to_string(), factory);
        let mut host = ExecutorHost::new(factories);

        assert!(!host.is_instantiated("echo"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ctx = test_ctx();
        host.ensure("echo", &ctx).await.unwrap();
        host.ensure("echo", &ctx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.instantiated_ids(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_host_unknown_executor() {
        let mut host = ExecutorHost::new(HashMap::new());
        let ctx = test_ctx();
        let result = host.ensure("ghost", &ctx).await;
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unit_handler_yields_no_result() {
        let h = unit_handler(|_value, _ctx| async { Ok(()) });
        let out = h(json!(1), test_ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, None);
    }
}
