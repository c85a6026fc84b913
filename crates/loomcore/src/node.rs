use crate::{
    Capability, CapabilityError, ConnectionType, EventEmitter, ExecutionId, ExecutionMode, Item,
    NodeError, NodeFailure, NodeId, NodeInstance, NodeTypeDescription, SupplyResponse, Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Hook of a node that transforms item batches.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Invoked once per run with every item that reached the node.
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure>;
}

/// Hook of a node that lazily builds a capability for its consumers.
#[async_trait]
pub trait SupplyDataNode: Send + Sync {
    async fn supply_data(&self, ctx: &NodeContext, output_index: usize) -> Result<SupplyResponse, NodeError>;
}

/// Resolves parameter values for one item. Expression evaluation lives behind
/// this seam; the core treats the returned value as opaque.
pub trait ParameterResolver: Send + Sync {
    fn resolve(&self, node: &NodeInstance, name: &str, item_index: usize) -> Option<Value>;
}

/// Returns the literal value stored on the node instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticParameters;

impl ParameterResolver for StaticParameters {
    fn resolve(&self, node: &NodeInstance, name: &str, _item_index: usize) -> Option<Value> {
        node.parameters.get(name).cloned()
    }
}

/// Source of capability values for a consumer's capability inputs.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Values of every supplier bound to `input` of `consumer`, in edge order.
    /// `path` lists the suppliers currently being constructed above the consumer.
    async fn provide(
        &self,
        consumer: NodeId,
        input: usize,
        path: &[NodeId],
    ) -> Result<Vec<crate::SuppliedData>, CapabilityError>;
}

/// Provider for contexts that are not attached to a graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapabilities;

#[async_trait]
impl CapabilityProvider for NoCapabilities {
    async fn provide(
        &self,
        consumer: NodeId,
        input: usize,
        _path: &[NodeId],
    ) -> Result<Vec<crate::SuppliedData>, CapabilityError> {
        Err(CapabilityError::MissingCapability { consumer, input })
    }
}

/// Context handed to `execute` and `supply_data` hooks
#[derive(Clone)]
pub struct NodeContext {
    pub node: Arc<NodeInstance>,
    pub description: Arc<NodeTypeDescription>,
    pub execution_id: ExecutionId,
    pub mode: ExecutionMode,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token of the run
    pub cancellation: CancellationToken,

    parameters: Arc<dyn ParameterResolver>,
    capabilities: Arc<dyn CapabilityProvider>,
    supplier_path: Vec<NodeId>,
}

impl NodeContext {
    pub fn new(
        node: Arc<NodeInstance>,
        description: Arc<NodeTypeDescription>,
        execution_id: ExecutionId,
        events: EventEmitter,
    ) -> Self {
        Self {
            node,
            description,
            execution_id,
            mode: ExecutionMode::default(),
            events,
            cancellation: CancellationToken::new(),
            parameters: Arc::new(StaticParameters),
            capabilities: Arc::new(NoCapabilities),
            supplier_path: Vec::new(),
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

    pub fn with_parameters(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.parameters = resolver;
        self
    }

    pub fn with_capabilities(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.capabilities = provider;
        self
    }

    /// Suppliers under construction above this node, outermost first.
    pub fn with_supplier_path(mut self, path: Vec<NodeId>) -> Self {
        self.supplier_path = path;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn supplier_path(&self) -> &[NodeId] {
        &self.supplier_path
    }

    pub fn continue_on_fail(&self) -> bool {
        self.node.continue_on_fail
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Parameter value for `item_index`, falling back to the schema default and then `default`.
    pub fn get_parameter(&self, name: &str, item_index: usize, default: impl Into<Value>) -> Value {
        self.parameters
            .resolve(&self.node, name, item_index)
            .or_else(|| {
                self.description
                    .parameter(name)
                    .map(|spec| spec.default.clone())
                    .filter(|v| !v.is_null())
            })
            .unwrap_or_else(|| default.into())
    }

    pub fn require_parameter(&self, name: &str, item_index: usize) -> Result<Value, NodeError> {
        let value = self.get_parameter(name, item_index, Value::Null);
        if value.is_null() {
            return Err(NodeError::Configuration(format!("Missing parameter: {}", name)));
        }
        Ok(value)
    }

    /// Accumulates output items and applies the node's continue-on-fail policy.
    pub fn collector(&self) -> OutputCollector {
        OutputCollector::new(self.description.outputs.len().max(1), self.continue_on_fail())
    }

    /// Index of the first input declared with `connection_type`.
    pub fn input_index(&self, connection_type: ConnectionType) -> Option<usize> {
        self.description
            .inputs
            .iter()
            .position(|p| p.connection_type == connection_type)
    }

    /// Values of all suppliers bound to capability input `input`.
    pub async fn capabilities(&self, input: usize) -> Result<Vec<crate::SuppliedData>, CapabilityError> {
        self.capabilities
            .provide(self.node.id, input, &self.supplier_path)
            .await
    }

    /// The value supplied to a single-supplier capability input.
    pub async fn capability(&self, input: usize) -> Result<crate::SuppliedData, CapabilityError> {
        let mut supplied = self.capabilities(input).await?;
        match supplied.len() {
            0 => Err(CapabilityError::MissingCapability {
                consumer: self.node.id,
                input,
            }),
            1 => Ok(supplied.remove(0)),
            n => Err(CapabilityError::InvariantViolation(format!(
                "input {} of node {} resolved {} suppliers where one was expected",
                input, self.node.id, n
            ))),
        }
    }

    /// Like [`NodeContext::capability`] but `None` when nothing is bound.
    pub async fn optional_capability(
        &self,
        input: usize,
    ) -> Result<Option<crate::SuppliedData>, CapabilityError> {
        match self.capability(input).await {
            Ok(data) => Ok(Some(data)),
            Err(CapabilityError::MissingCapability { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Single capability from the first input of the given type.
    pub async fn capability_of(
        &self,
        connection_type: ConnectionType,
    ) -> Result<crate::SuppliedData, CapabilityError> {
        let input = self
            .input_index(connection_type)
            .ok_or(CapabilityError::NoSuchInput {
                consumer: self.node.id,
                connection_type,
            })?;
        self.capability(input).await
    }

    /// Every provider bound to any input of the given type, collections expanded.
    pub async fn capabilities_of(
        &self,
        connection_type: ConnectionType,
    ) -> Result<Vec<Capability>, CapabilityError> {
        let mut all = Vec::new();
        let indices: Vec<usize> = self
            .description
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.connection_type == connection_type)
            .map(|(i, _)| i)
            .collect();
        for input in indices {
            for data in self.capabilities(input).await? {
                all.extend(data.capabilities());
            }
        }
        Ok(all)
    }
}

/// Items arriving on each input, aligned with the type's declared inputs.
/// Capability inputs are always empty here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInput {
    inputs: Vec<Vec<Item>>,
}

impl NodeInput {
    pub fn new(inputs: Vec<Vec<Item>>) -> Self {
        Self { inputs }
    }

    /// Single-input shorthand.
    pub fn from_items(items: Vec<Item>) -> Self {
        Self { inputs: vec![items] }
    }

    pub fn items(&self, input: usize) -> &[Item] {
        self.inputs.get(input).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_items(mut self, input: usize) -> Vec<Item> {
        if input < self.inputs.len() {
            std::mem::take(&mut self.inputs[input])
        } else {
            Vec::new()
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.iter().all(Vec::is_empty)
    }

    pub fn item_count(&self) -> usize {
        self.inputs.iter().map(Vec::len).sum()
    }
}

/// Output from node execution, one item list per declared output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub outputs: Vec<Vec<Item>>,

    /// Execution metadata
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output with `items` on output 0.
    pub fn from_items(items: Vec<Item>) -> Self {
        Self {
            outputs: vec![items],
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_items(mut self, output: usize, items: Vec<Item>) -> Self {
        if self.outputs.len() <= output {
            self.outputs.resize_with(output + 1, Vec::new);
        }
        self.outputs[output] = items;
        self
    }

    pub fn items(&self, output: usize) -> &[Item] {
        self.outputs.get(output).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn item_count(&self) -> usize {
        self.outputs.iter().map(Vec::len).sum()
    }

    /// Append `other` output-wise.
    pub fn extend(&mut self, other: NodeOutput) {
        for (index, items) in other.outputs.into_iter().enumerate() {
            if self.outputs.len() <= index {
                self.outputs.resize_with(index + 1, Vec::new);
            }
            self.outputs[index].extend(items);
        }
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    pub attempts: u32,
    pub custom: HashMap<String, Value>,
}

/// Builds a node's output item by item.
///
/// `fail` either records an error item (continue-on-fail) or returns the
/// [`NodeFailure`] that aborts the run, carrying the items pushed so far.
#[derive(Debug)]
pub struct OutputCollector {
    output: NodeOutput,
    continue_on_fail: bool,
}

impl OutputCollector {
    pub fn new(outputs: usize, continue_on_fail: bool) -> Self {
        Self {
            output: NodeOutput {
                outputs: vec![Vec::new(); outputs],
                metadata: NodeMetadata::default(),
            },
            continue_on_fail,
        }
    }

    pub fn push(&mut self, output: usize, item: Item) {
        if self.output.outputs.len() <= output {
            self.output.outputs.resize_with(output + 1, Vec::new);
        }
        self.output.outputs[output].push(item);
    }

    pub fn fail(&mut self, item_index: usize, error: NodeError) -> Result<(), NodeFailure> {
        if self.continue_on_fail {
            self.push(0, Item::error(item_index, error.to_string()));
            return Ok(());
        }
        Err(NodeFailure::new(error)
            .at_item(item_index)
            .with_partial(self.output.clone()))
    }

    pub fn finish(self) -> NodeOutput {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBus, PortSpec};
    use uuid::Uuid;

    fn context(node: NodeInstance) -> NodeContext {
        let bus = EventBus::new(16);
        let description = NodeTypeDescription::new("test.node", 1u32)
            .with_input(PortSpec::main("Input"))
            .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model"))
            .with_output(PortSpec::main("Output"))
            .with_parameter(
                crate::ParameterSpec::new("mode", crate::ParameterKind::String).with_default("fast"),
            );
        let node_id = node.id;
        NodeContext::new(
            Arc::new(node),
            Arc::new(description),
            Uuid::new_v4(),
            bus.create_emitter(None, node_id),
        )
    }

    #[test]
    fn parameter_fallback_order() {
        let ctx = context(NodeInstance::new("test.node").with_parameter("limit", 5i64));
        assert_eq!(ctx.get_parameter("limit", 0, 1i64), Value::Number(5.0));
        assert_eq!(ctx.get_parameter("mode", 0, "slow"), Value::String("fast".into()));
        assert_eq!(ctx.get_parameter("other", 0, "x"), Value::String("x".into()));
        assert!(ctx.require_parameter("other", 0).is_err());
    }

    #[test]
    fn collector_fails_fast_with_partial_output() {
        let mut collector = OutputCollector::new(1, false);
        collector.push(0, Item::new("a"));
        let failure = collector
            .fail(1, NodeError::ExecutionFailed("boom".into()))
            .unwrap_err();
        assert_eq!(failure.item_index, Some(1));
        assert_eq!(failure.partial.items(0).len(), 1);
    }

    #[test]
    fn collector_tags_error_items_when_continuing() {
        let mut collector = OutputCollector::new(1, true);
        collector.push(0, Item::new("a"));
        collector
            .fail(1, NodeError::ExecutionFailed("boom".into()))
            .unwrap();
        collector.push(0, Item::new("c"));
        let output = collector.finish();
        assert_eq!(output.items(0).len(), 3);
        assert!(output.items(0)[1].is_error());
    }

    #[tokio::test]
    async fn detached_context_reports_missing_capability() {
        let ctx = context(NodeInstance::new("test.node"));
        let err = ctx.capability_of(ConnectionType::LanguageModel).await.unwrap_err();
        assert!(matches!(err, CapabilityError::MissingCapability { input: 1, .. }));
        assert!(ctx
            .optional_capability(1)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            ctx.capability_of(ConnectionType::Memory).await,
            Err(CapabilityError::NoSuchInput { .. })
        ));
    }
}
