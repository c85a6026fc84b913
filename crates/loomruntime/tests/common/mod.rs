#![allow(dead_code)]

use async_trait::async_trait;
use loomcore::{
    Capability, ConnectionType, ExecutableNode, Item, NodeContext, NodeError, NodeFailure,
    NodeInput, NodeOutput, NodeTypeDescription, NodeTypeDescriptor, OutputCollector, PortSpec,
    SupplyDataNode, SupplyResponse, TriggerContext, TriggerNode, TriggerResponse, Value,
};
use loomruntime::NodeTypeRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route runtime logs to the test harness; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Emits `count` numbered items.
pub struct Source;

#[async_trait]
impl ExecutableNode for Source {
    async fn execute(&self, ctx: &NodeContext, _input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let count = ctx.get_parameter("count", 0, 3i64).as_f64().unwrap_or(3.0) as usize;
        Ok(NodeOutput::from_items(
            (0..count).map(|i| Item::new(Value::Number(i as f64))).collect(),
        ))
    }
}

/// Passes items through, failing on the item index given by `fail_on`.
pub struct Sink;

#[async_trait]
impl ExecutableNode for Sink {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let fail_on = ctx.get_parameter("fail_on", 0, Value::Null).as_f64().map(|v| v as usize);
        let mut collector = ctx.collector();
        for (index, item) in input.into_items(0).into_iter().enumerate() {
            if Some(index) == fail_on {
                collector.fail(index, NodeError::ExecutionFailed(format!("rejected item {}", index)))?;
                continue;
            }
            collector.push(0, item.paired(index));
        }
        Ok(collector.finish())
    }
}

/// Fails as a whole for its first `failures` invocations.
pub struct Flaky {
    pub calls: Arc<AtomicUsize>,
    pub failures: usize,
}

#[async_trait]
impl ExecutableNode for Flaky {
    async fn execute(&self, _ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(NodeError::ExecutionFailed("not yet".into()).into());
        }
        Ok(NodeOutput::from_items(input.into_items(0)))
    }
}

pub struct Slow;

#[async_trait]
impl ExecutableNode for Slow {
    async fn execute(&self, _ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(NodeOutput::from_items(input.into_items(0)))
    }
}

/// Sends items to output 0 or 1 depending on whether they are even.
pub struct Split;

#[async_trait]
impl ExecutableNode for Split {
    async fn execute(&self, _ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let mut collector = OutputCollector::new(2, false);
        for item in input.into_items(0) {
            let even = item.json.as_f64().map(|v| v as i64 % 2 == 0).unwrap_or(false);
            collector.push(if even { 0 } else { 1 }, item);
        }
        Ok(collector.finish())
    }
}

#[derive(Debug)]
pub struct EchoModel;

/// Counts constructions and close calls.
pub struct CountingModel {
    pub calls: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SupplyDataNode for CountingModel {
    async fn supply_data(&self, _ctx: &NodeContext, _output: usize) -> Result<SupplyResponse, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let closed = Arc::clone(&self.closed);
        Ok(SupplyResponse::single(EchoModel).with_close(move || {
            Box::pin(async move {
                closed.fetch_add(1, Ordering::SeqCst);
            })
        }))
    }
}

/// Records the model it receives, then passes items through.
pub struct Consumer {
    pub seen: Arc<Mutex<Vec<Capability>>>,
}

#[async_trait]
impl ExecutableNode for Consumer {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let model = ctx.capability_of(ConnectionType::LanguageModel).await?;
        let capability = model
            .as_single()
            .cloned()
            .ok_or_else(|| NodeError::Configuration("expected a single model".into()))?;
        capability.downcast::<EchoModel>()?;
        self.seen.lock().unwrap().push(capability);
        Ok(NodeOutput::from_items(input.into_items(0)))
    }
}

/// Trigger with a teardown counter and a manual routine emitting two items.
pub struct RecordingTrigger {
    pub activations: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
    pub interval: Option<Duration>,
    /// How long the activation hook takes.
    pub delay: Duration,
}

#[async_trait]
impl TriggerNode for RecordingTrigger {
    async fn trigger(&self, _ctx: &TriggerContext) -> Result<TriggerResponse, NodeError> {
        tokio::time::sleep(self.delay).await;
        self.activations.fetch_add(1, Ordering::SeqCst);
        let teardowns = Arc::clone(&self.teardowns);
        let mut response = TriggerResponse::new()
            .with_teardown(move || {
                Box::pin(async move {
                    teardowns.fetch_add(1, Ordering::SeqCst);
                })
            })
            .with_manual(|| {
                Box::pin(async {
                    Ok(vec![
                        Item::new(Value::Number(10.0)),
                        Item::new(Value::Number(11.0)),
                    ])
                })
            });
        if let Some(interval) = self.interval {
            response = response.with_schedule(interval, |emitter| {
                Box::pin(async move {
                    emitter.emit(vec![Item::new("tick")]);
                    Ok(())
                })
            });
        }
        Ok(response)
    }
}

/// Shared counters of the fixture registry.
#[derive(Default, Clone)]
pub struct Counters {
    pub model_calls: Arc<AtomicUsize>,
    pub model_closed: Arc<AtomicUsize>,
    pub flaky_calls: Arc<AtomicUsize>,
    pub seen_models: Arc<Mutex<Vec<Capability>>>,
    pub activations: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
}

pub fn registry(counters: &Counters) -> NodeTypeRegistry {
    registry_with_interval(counters, None)
}

pub fn registry_with_interval(counters: &Counters, interval: Option<Duration>) -> NodeTypeRegistry {
    init_tracing();
    let mut registry = NodeTypeRegistry::new();
    let descriptors = vec![
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.source", 1u32).with_output(PortSpec::main("Output")),
            Source,
        ),
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.sink", 1u32)
                .with_input(PortSpec::main("Input"))
                .with_output(PortSpec::main("Output")),
            Sink,
        ),
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.split", 1u32)
                .with_input(PortSpec::main("Input"))
                .with_output(PortSpec::main("Even"))
                .with_output(PortSpec::main("Odd")),
            Split,
        ),
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.flaky", 1u32)
                .with_input(PortSpec::main("Input"))
                .with_output(PortSpec::main("Output")),
            Flaky {
                calls: Arc::clone(&counters.flaky_calls),
                failures: 2,
            },
        ),
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.slow", 1u32)
                .with_input(PortSpec::main("Input"))
                .with_output(PortSpec::main("Output")),
            Slow,
        ),
        NodeTypeDescriptor::supply_data(
            NodeTypeDescription::new("test.model", 1u32)
                .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model")),
            CountingModel {
                calls: Arc::clone(&counters.model_calls),
                closed: Arc::clone(&counters.model_closed),
            },
        ),
        NodeTypeDescriptor::execute(
            NodeTypeDescription::new("test.consumer", 1u32)
                .with_input(PortSpec::main("Input"))
                .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model").required())
                .with_output(PortSpec::main("Output")),
            Consumer {
                seen: Arc::clone(&counters.seen_models),
            },
        ),
        NodeTypeDescriptor::trigger(
            NodeTypeDescription::new("test.trigger", 1u32).with_output(PortSpec::main("Output")),
            RecordingTrigger {
                activations: Arc::clone(&counters.activations),
                teardowns: Arc::clone(&counters.teardowns),
                interval,
                delay: Duration::ZERO,
            },
        ),
        NodeTypeDescriptor::trigger(
            NodeTypeDescription::new("test.slow_trigger", 1u32).with_output(PortSpec::main("Output")),
            RecordingTrigger {
                activations: Arc::clone(&counters.activations),
                teardowns: Arc::clone(&counters.teardowns),
                interval: Some(Duration::from_millis(10)),
                delay: Duration::from_millis(200),
            },
        ),
    ];
    for descriptor in descriptors {
        registry.register(descriptor).unwrap();
    }
    registry
}

pub fn numbers(items: &[Item]) -> Vec<f64> {
    items.iter().filter_map(|i| i.json.as_f64()).collect()
}
