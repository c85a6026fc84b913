//! Lazy construction of capability values for consumer nodes.

use crate::graph::{ConnectionGraph, ResolvedNode};
use async_trait::async_trait;
use chrono::Utc;
use loomcore::{
    CapabilityError, CapabilityProvider, CloseFn, EventBus, ExecutionEvent, ExecutionId,
    ExecutionMode, NodeBehavior, NodeContext, NodeError, NodeId, NodeOutcome, NodeRunRecord,
    ParameterResolver, PortRef, SuppliedData,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

/// Outcome of one supplier construction.
type Supplied = Result<SuppliedData, CapabilityError>;

/// Capability values built during one run, keyed by supplier output.
///
/// Each key is constructed at most once; later requests share the stored
/// value, or the stored error when construction failed.
#[derive(Default)]
pub struct CapabilityCache {
    cells: Mutex<HashMap<PortRef, Arc<OnceCell<Supplied>>>>,
    closers: Mutex<Vec<CloseFn>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, key: PortRef) -> Arc<OnceCell<Supplied>> {
        let mut cells = self.cells.lock().await;
        Arc::clone(cells.entry(key).or_default())
    }

    /// Value already built for `key`, if any.
    pub async fn get(&self, key: PortRef) -> Option<SuppliedData> {
        let cells = self.cells.lock().await;
        cells
            .get(&key)
            .and_then(|cell| cell.get())
            .and_then(|outcome| outcome.as_ref().ok().cloned())
    }

    /// Number of supplier outputs materialized so far.
    pub async fn len(&self) -> usize {
        let cells = self.cells.lock().await;
        cells
            .values()
            .filter(|cell| matches!(cell.get(), Some(Ok(_))))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn push_closer(&self, close: CloseFn) {
        self.closers.lock().await.push(close);
    }

    /// Run every collected close routine, newest first. Idempotent.
    pub async fn close_all(&self) {
        let closers: Vec<CloseFn> = std::mem::take(&mut *self.closers.lock().await);
        for close in closers.into_iter().rev() {
            close().await;
        }
    }
}

/// Walks capability edges upstream from a consumer and materializes suppliers.
///
/// One resolver serves one run; clones share the run's cache.
#[derive(Clone)]
pub struct CapabilityResolver {
    graph: Arc<ConnectionGraph>,
    cache: Arc<CapabilityCache>,
    events: Arc<EventBus>,
    execution_id: ExecutionId,
    mode: ExecutionMode,
    cancellation: CancellationToken,
    parameters: Arc<dyn ParameterResolver>,
    max_depth: usize,
}

impl CapabilityResolver {
    pub fn new(
        graph: Arc<ConnectionGraph>,
        cache: Arc<CapabilityCache>,
        events: Arc<EventBus>,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            graph,
            cache,
            events,
            execution_id,
            mode: ExecutionMode::default(),
            cancellation: CancellationToken::new(),
            parameters: Arc::new(loomcore::StaticParameters),
            max_depth: crate::runtime::DEFAULT_CAPABILITY_DEPTH,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_parameters(mut self, parameters: Arc<dyn ParameterResolver>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn cache(&self) -> &Arc<CapabilityCache> {
        &self.cache
    }

    /// Context a hook of `node` runs with inside this run.
    pub fn context_for(&self, node: &ResolvedNode, supplier_path: Vec<NodeId>) -> NodeContext {
        NodeContext::new(
            Arc::clone(&node.instance),
            Arc::clone(&node.description),
            self.execution_id,
            self.events.create_emitter(Some(self.execution_id), node.id()),
        )
        .with_mode(self.mode)
        .with_cancellation(self.cancellation.clone())
        .with_parameters(Arc::clone(&self.parameters))
        .with_capabilities(Arc::new(self.clone()))
        .with_supplier_path(supplier_path)
    }

    /// Resolve every supplier bound to `input` of `consumer`, in edge order.
    pub async fn resolve(
        &self,
        consumer: NodeId,
        input: usize,
        path: &[NodeId],
    ) -> Result<Vec<SuppliedData>, CapabilityError> {
        let node = self.graph.node(consumer).ok_or_else(|| {
            CapabilityError::InvariantViolation(format!("consumer {} is not in the graph", consumer))
        })?;
        let port = node
            .input(input)
            .filter(|p| !p.is_item_stream())
            .ok_or(CapabilityError::NotACapabilityPort {
                node_id: consumer,
                input,
            })?;

        if path.len() >= self.max_depth {
            return Err(CapabilityError::DepthExceeded {
                limit: self.max_depth,
            });
        }

        let edges = self.graph.enabled_suppliers(PortRef::new(consumer, input));
        if let Some(max) = port.max_connections.limit() {
            if edges.len() > max {
                tracing::error!(
                    target: "loom::consistency",
                    consumer = %consumer,
                    input,
                    bound = edges.len(),
                    max,
                    "Capability input has more suppliers than it allows"
                );
                return Err(CapabilityError::InvariantViolation(format!(
                    "input {} of node {} has {} suppliers bound, at most {} allowed",
                    input,
                    consumer,
                    edges.len(),
                    max
                )));
            }
        }

        if edges.is_empty() {
            if port.required {
                tracing::error!(
                    target: "loom::consistency",
                    consumer = %consumer,
                    input,
                    "Required capability input has no supplier at run time"
                );
                return Err(CapabilityError::MissingCapability { consumer, input });
            }
            return Ok(Vec::new());
        }

        let mut chain = path.to_vec();
        if chain.last() != Some(&consumer) {
            chain.push(consumer);
        }

        let mut supplied = Vec::with_capacity(edges.len());
        for edge in edges {
            let supplier = edge.source.node_id;
            if chain.contains(&supplier) {
                let mut cycle = chain.clone();
                cycle.push(supplier);
                return Err(CapabilityError::Cycle { path: cycle });
            }
            supplied.push(self.supply(edge.source, &chain).await?);
        }
        Ok(supplied)
    }

    async fn supply(&self, source: PortRef, chain: &[NodeId]) -> Result<SuppliedData, CapabilityError> {
        let cell = self.cache.cell(source).await;
        if let Some(outcome) = cell.get() {
            tracing::debug!(supplier = %source.node_id, output = source.index, "Capability cache hit");
            return outcome.clone();
        }

        cell.get_or_init(|| self.construct(source, chain))
            .await
            .clone()
    }

    async fn construct(&self, source: PortRef, chain: &[NodeId]) -> Result<SuppliedData, CapabilityError> {
        let node = self
            .graph
            .node(source.node_id)
            .ok_or(CapabilityError::NotASupplier(source.node_id))?;
        let NodeBehavior::SupplyData(hook) = node.behavior() else {
            return Err(CapabilityError::NotASupplier(source.node_id));
        };

        let mut path = chain.to_vec();
        path.push(source.node_id);
        let ctx = self.context_for(node, path);

        tracing::debug!(
            supplier = %source.node_id,
            node_type = %node.instance.type_name,
            output = source.index,
            "Constructing capability"
        );
        self.events.emit(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            node_id: source.node_id,
            node_type: node.instance.type_name.clone(),
            attempt: 1,
            timestamp: Utc::now(),
        });

        let started_at = Utc::now();
        let result = hook.supply_data(&ctx, source.index).await;
        let outcome = match &result {
            Ok(response) => NodeOutcome::Items {
                count: response.data.capabilities().len(),
            },
            Err(e) => NodeOutcome::Error {
                message: e.to_string(),
                item_index: None,
            },
        };
        self.events.emit(ExecutionEvent::NodeFinished {
            execution_id: self.execution_id,
            record: NodeRunRecord {
                node_id: source.node_id,
                node_type: node.instance.type_name.clone(),
                attempt: 1,
                started_at,
                finished_at: Utc::now(),
                outcome,
            },
        });

        match result {
            Ok(response) => {
                if let Some(close) = response.close {
                    self.cache.push_closer(close).await;
                }
                Ok(response.data)
            }
            // Errors from deeper in the sub-tree keep their identity.
            Err(NodeError::Capability(inner)) => Err(inner),
            Err(e) => Err(CapabilityError::Supply {
                node: source.node_id,
                source: Box::new(e),
            }),
        }
    }
}

#[async_trait]
impl CapabilityProvider for CapabilityResolver {
    async fn provide(
        &self,
        consumer: NodeId,
        input: usize,
        path: &[NodeId],
    ) -> Result<Vec<SuppliedData>, CapabilityError> {
        self.resolve(consumer, input, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RunStart, WorkflowExecutor};
    use crate::registry::NodeTypeRegistry;
    use loomcore::{
        ConnectionType, ConnectionTypeRegistry, ExecutableNode, Item, MaxConnections, NodeFailure,
        NodeInput, NodeInstance, NodeOutput, NodeTypeDescription, NodeTypeDescriptor, PortSpec,
        RunStatus, SupplyDataNode, SupplyResponse, Value, Workflow,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SupplyDataNode for Counted {
        async fn supply_data(&self, _ctx: &NodeContext, _output: usize) -> Result<SupplyResponse, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::clone(&self.closed);
            Ok(SupplyResponse::single(String::from("model")).with_close(move || {
                Box::pin(async move {
                    closed.fetch_add(1, Ordering::SeqCst);
                })
            }))
        }
    }

    /// Supplier that itself needs a model.
    struct Wrapping;

    #[async_trait]
    impl SupplyDataNode for Wrapping {
        async fn supply_data(&self, ctx: &NodeContext, _output: usize) -> Result<SupplyResponse, NodeError> {
            let inner = ctx.capability_of(ConnectionType::LanguageModel).await?;
            Ok(SupplyResponse::new(inner))
        }
    }

    /// Supplier whose construction always fails.
    struct Broken {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SupplyDataNode for Broken {
        async fn supply_data(&self, _ctx: &NodeContext, _output: usize) -> Result<SupplyResponse, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NodeError::ExecutionFailed("model offline".into()))
        }
    }

    struct One;

    #[async_trait]
    impl ExecutableNode for One {
        async fn execute(&self, _ctx: &NodeContext, _input: NodeInput) -> Result<NodeOutput, NodeFailure> {
            Ok(NodeOutput::from_items(vec![Item::new(Value::Number(1.0))]))
        }
    }

    /// Asks for its model on every call.
    struct Strict;

    #[async_trait]
    impl ExecutableNode for Strict {
        async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
            ctx.capability_of(ConnectionType::LanguageModel).await?;
            Ok(NodeOutput::from_items(input.into_items(0)))
        }
    }

    struct Pass;

    #[async_trait]
    impl ExecutableNode for Pass {
        async fn execute(&self, _ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
            Ok(NodeOutput::from_items(input.into_items(0)))
        }
    }

    struct Fixture {
        registry: NodeTypeRegistry,
        calls: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        broken_calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let broken_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = NodeTypeRegistry::new();
        registry
            .register(NodeTypeDescriptor::supply_data(
                NodeTypeDescription::new("test.broken", 1u32)
                    .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model")),
                Broken {
                    calls: Arc::clone(&broken_calls),
                },
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.one", 1u32).with_output(PortSpec::main("Output")),
                One,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.strict", 1u32)
                    .with_input(PortSpec::main("Input"))
                    .with_input(
                        PortSpec::new(ConnectionType::LanguageModel, "Model")
                            .required()
                            .with_max_connections(MaxConnections::Limited(1)),
                    )
                    .with_output(PortSpec::main("Output")),
                Strict,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::supply_data(
                NodeTypeDescription::new("test.model", 1u32)
                    .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model")),
                Counted {
                    calls: Arc::clone(&calls),
                    closed: Arc::clone(&closed),
                },
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::supply_data(
                NodeTypeDescription::new("test.wrapper", 1u32)
                    .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model"))
                    .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model")),
                Wrapping,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.consumer", 1u32)
                    .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model"))
                    .with_output(PortSpec::main("Output")),
                Pass,
            ))
            .unwrap();
        Fixture {
            registry,
            calls,
            closed,
            broken_calls,
        }
    }

    fn unchecked_graph(workflow: &Workflow, registry: &NodeTypeRegistry) -> Arc<ConnectionGraph> {
        Arc::new(
            ConnectionGraph::from_workflow_unchecked(workflow, registry, &ConnectionTypeRegistry::standard())
                .unwrap(),
        )
    }

    async fn run_from(graph: Arc<ConnectionGraph>, start: NodeId) -> crate::executor::ExecutionResult {
        WorkflowExecutor::new()
            .execute(
                graph,
                Arc::new(EventBus::new(64)),
                RunStart::new(start),
                ExecutionMode::Manual,
                CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    /// One item source feeding two continue-on-fail consumers.
    fn two_consumers(wf: &mut Workflow) -> (NodeId, NodeId, NodeId) {
        let source = wf.add_node(NodeInstance::new("test.one"));
        let c = wf.add_node(NodeInstance::new("test.strict").continue_on_fail(true));
        let e = wf.add_node(NodeInstance::new("test.strict").continue_on_fail(true));
        wf.connect(source, 0, c, 0);
        wf.connect(source, 0, e, 0);
        (source, c, e)
    }

    fn one_consumer(wf: &mut Workflow) -> (NodeId, NodeId) {
        let source = wf.add_node(NodeInstance::new("test.one"));
        let c = wf.add_node(NodeInstance::new("test.strict").continue_on_fail(true));
        wf.connect(source, 0, c, 0);
        (source, c)
    }

    fn resolver_for(workflow: &Workflow, registry: &NodeTypeRegistry) -> CapabilityResolver {
        let graph = ConnectionGraph::from_workflow(workflow, registry, &ConnectionTypeRegistry::standard())
            .unwrap();
        CapabilityResolver::new(
            Arc::new(graph),
            Arc::new(CapabilityCache::new()),
            Arc::new(EventBus::new(64)),
            ExecutionId::new_v4(),
        )
    }

    #[tokio::test]
    async fn shared_supplier_is_built_once() {
        let fx = fixture();
        let mut wf = Workflow::new("shared");
        let model = wf.add_node(NodeInstance::new("test.model"));
        let c = wf.add_node(NodeInstance::new("test.consumer"));
        let e = wf.add_node(NodeInstance::new("test.consumer"));
        wf.connect(model, 0, c, 0);
        wf.connect(model, 0, e, 0);
        let resolver = resolver_for(&wf, &fx.registry);

        let first = resolver.resolve(c, 0, &[]).await.unwrap();
        let second = resolver.resolve(e, 0, &[]).await.unwrap();
        let again = resolver.resolve(c, 0, &[]).await.unwrap();

        assert!(first[0].ptr_eq(&second[0]));
        assert!(first[0].ptr_eq(&again[0]));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cache().len().await, 1);

        resolver.cache().close_all().await;
        resolver.cache().close_all().await;
        assert_eq!(fx.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nested_suppliers_resolve_depth_first() {
        let fx = fixture();
        let mut wf = Workflow::new("nested");
        let model = wf.add_node(NodeInstance::new("test.model"));
        let wrapper = wf.add_node(NodeInstance::new("test.wrapper"));
        let consumer = wf.add_node(NodeInstance::new("test.consumer"));
        wf.connect(model, 0, wrapper, 0);
        wf.connect(wrapper, 0, consumer, 0);
        let resolver = resolver_for(&wf, &fx.registry);

        let outer = resolver.resolve(consumer, 0, &[]).await.unwrap();
        let inner = resolver.cache().get(PortRef::new(model, 0)).await.unwrap();
        assert!(outer[0].ptr_eq(&inner));
        assert_eq!(resolver.cache().len().await, 2);
    }

    #[tokio::test]
    async fn capability_cycle_is_reported() {
        let fx = fixture();
        let mut wf = Workflow::new("loop");
        let a = wf.add_node(NodeInstance::new("test.wrapper"));
        let b = wf.add_node(NodeInstance::new("test.wrapper"));
        let consumer = wf.add_node(NodeInstance::new("test.consumer"));
        wf.connect(a, 0, b, 0);
        wf.connect(b, 0, a, 0);
        wf.connect(a, 0, consumer, 0);
        let resolver = resolver_for(&wf, &fx.registry);

        match resolver.resolve(consumer, 0, &[]).await {
            Err(CapabilityError::Cycle { path }) => assert_eq!(path, vec![consumer, a, b, a]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn depth_limit_bounds_recursion() {
        let fx = fixture();
        let mut wf = Workflow::new("deep");
        let model = wf.add_node(NodeInstance::new("test.model"));
        let mut upstream = model;
        for _ in 0..3 {
            let wrapper = wf.add_node(NodeInstance::new("test.wrapper"));
            wf.connect(upstream, 0, wrapper, 0);
            upstream = wrapper;
        }
        let consumer = wf.add_node(NodeInstance::new("test.consumer"));
        wf.connect(upstream, 0, consumer, 0);
        let resolver = resolver_for(&wf, &fx.registry).with_max_depth(2);

        assert_eq!(
            resolver.resolve(consumer, 0, &[]).await.unwrap_err(),
            CapabilityError::DepthExceeded { limit: 2 }
        );
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unbound_optional_input_resolves_empty() {
        let fx = fixture();
        let mut wf = Workflow::new("optional");
        let consumer = wf.add_node(NodeInstance::new("test.consumer"));
        let resolver = resolver_for(&wf, &fx.registry);
        assert!(resolver.resolve(consumer, 0, &[]).await.unwrap().is_empty());
        assert!(matches!(
            resolver.resolve(consumer, 5, &[]).await,
            Err(CapabilityError::NotACapabilityPort { input: 5, .. })
        ));
    }

    #[tokio::test]
    async fn failed_construction_is_not_retried_within_a_run() {
        let fx = fixture();
        let mut wf = Workflow::new("broken model");
        let (_, c, e) = two_consumers(&mut wf);
        let model = wf.add_node(NodeInstance::new("test.broken"));
        wf.connect(model, 0, c, 1);
        wf.connect(model, 0, e, 1);
        let resolver = resolver_for(&wf, &fx.registry);

        let first = resolver.resolve(c, 1, &[]).await.unwrap_err();
        let second = resolver.resolve(e, 1, &[]).await.unwrap_err();

        assert!(matches!(first, CapabilityError::Supply { node, .. } if node == model));
        assert_eq!(first, second);
        assert_eq!(fx.broken_calls.load(Ordering::SeqCst), 1);
        assert!(resolver.cache().get(PortRef::new(model, 0)).await.is_none());
        assert!(resolver.cache().is_empty().await);
    }

    #[tokio::test]
    async fn consumers_sharing_a_failing_supplier_continue_with_one_construction() {
        let fx = fixture();
        let mut wf = Workflow::new("broken model run");
        let (source, c, e) = two_consumers(&mut wf);
        let model = wf.add_node(NodeInstance::new("test.broken"));
        wf.connect(model, 0, c, 1);
        wf.connect(model, 0, e, 1);
        let graph = ConnectionGraph::from_workflow(&wf, &fx.registry, &ConnectionTypeRegistry::standard())
            .unwrap();

        let result = run_from(Arc::new(graph), source).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.items(c, 0)[0].is_error());
        assert!(result.items(e, 0)[0].is_error());
        assert_eq!(fx.broken_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn required_input_without_supplier_at_call_time() {
        let fx = fixture();
        let mut wf = Workflow::new("unbound");
        let (source, c) = one_consumer(&mut wf);
        let graph = unchecked_graph(&wf, &fx.registry);
        let resolver = CapabilityResolver::new(
            Arc::clone(&graph),
            Arc::new(CapabilityCache::new()),
            Arc::new(EventBus::new(64)),
            ExecutionId::new_v4(),
        );

        assert_eq!(
            resolver.resolve(c, 1, &[]).await.unwrap_err(),
            CapabilityError::MissingCapability { consumer: c, input: 1 }
        );

        // Internal errors abort the run even under continue-on-fail.
        let result = run_from(graph, source).await;
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.node_id, c);
        assert!(error.error.is_internal());
        assert!(matches!(
            error.error,
            NodeError::Capability(CapabilityError::MissingCapability { .. })
        ));
    }

    #[tokio::test]
    async fn more_suppliers_than_allowed_is_an_invariant_violation() {
        let fx = fixture();
        let mut wf = Workflow::new("overbound");
        let (source, c) = one_consumer(&mut wf);
        let first = wf.add_node(NodeInstance::new("test.model"));
        let second = wf.add_node(NodeInstance::new("test.model"));
        wf.connect(first, 0, c, 1);
        wf.connect(second, 0, c, 1);
        let graph = unchecked_graph(&wf, &fx.registry);
        let resolver = CapabilityResolver::new(
            Arc::clone(&graph),
            Arc::new(CapabilityCache::new()),
            Arc::new(EventBus::new(64)),
            ExecutionId::new_v4(),
        );

        assert!(matches!(
            resolver.resolve(c, 1, &[]).await,
            Err(CapabilityError::InvariantViolation(_))
        ));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);

        let result = run_from(graph, source).await;
        assert_eq!(result.status, RunStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.node_id, c);
        assert!(matches!(
            error.error,
            NodeError::Capability(CapabilityError::InvariantViolation(_))
        ));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }
}
