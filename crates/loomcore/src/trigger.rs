//! Contract between trigger nodes and the trigger lifecycle manager.

use crate::{
    EventEmitter, Item, NodeError, NodeId, NodeInstance, NodeTypeDescription, ParameterResolver,
    StaticParameters, Value, WorkflowId,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle transition a trigger is being started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Process start-up re-activating persisted active workflows.
    Init,
    /// A user switched the workflow on.
    Activate,
    /// An already active workflow was edited.
    Update,
    /// Interactive test invocation.
    Manual,
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivationMode::Init => "init",
            ActivationMode::Activate => "activate",
            ActivationMode::Update => "update",
            ActivationMode::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Hook of a node that produces items outside of a run.
#[async_trait]
pub trait TriggerNode: Send + Sync {
    async fn trigger(&self, ctx: &TriggerContext) -> Result<TriggerResponse, NodeError>;
}

/// Receives items emitted by triggers and turns each emission into a run.
pub trait EmitSink: Send + Sync {
    fn emit(&self, node_id: NodeId, items: Vec<Item>);
}

/// Handle a trigger uses to push items into the workflow.
#[derive(Clone)]
pub struct TriggerEmitter {
    node_id: NodeId,
    sink: Arc<dyn EmitSink>,
}

impl TriggerEmitter {
    pub fn new(node_id: NodeId, sink: Arc<dyn EmitSink>) -> Self {
        Self { node_id, sink }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Starts an independent run fed with `items`.
    pub fn emit(&self, items: Vec<Item>) {
        self.sink.emit(self.node_id, items);
    }
}

impl fmt::Debug for TriggerEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEmitter").field("node_id", &self.node_id).finish()
    }
}

/// Context handed to `trigger` hooks
#[derive(Clone)]
pub struct TriggerContext {
    pub node: Arc<NodeInstance>,
    pub description: Arc<NodeTypeDescription>,
    pub workflow_id: WorkflowId,
    pub mode: ActivationMode,
    pub events: EventEmitter,
    emitter: TriggerEmitter,
    parameters: Arc<dyn ParameterResolver>,
}

impl TriggerContext {
    pub fn new(
        node: Arc<NodeInstance>,
        description: Arc<NodeTypeDescription>,
        workflow_id: WorkflowId,
        mode: ActivationMode,
        events: EventEmitter,
        emitter: TriggerEmitter,
    ) -> Self {
        Self {
            node,
            description,
            workflow_id,
            mode,
            events,
            emitter,
            parameters: Arc::new(StaticParameters),
        }
    }

    pub fn with_parameters(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.parameters = resolver;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn get_parameter(&self, name: &str, default: impl Into<Value>) -> Value {
        self.parameters
            .resolve(&self.node, name, 0)
            .or_else(|| {
                self.description
                    .parameter(name)
                    .map(|spec| spec.default.clone())
                    .filter(|v| !v.is_null())
            })
            .unwrap_or_else(|| default.into())
    }

    pub fn emitter(&self) -> TriggerEmitter {
        self.emitter.clone()
    }

    pub fn emit(&self, items: Vec<Item>) {
        self.emitter.emit(items);
    }
}

pub type ManualFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Item>, NodeError>> + Send + Sync>;
pub type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
pub type ScheduledFn =
    Arc<dyn Fn(TriggerEmitter) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

/// Callback the lifecycle manager runs every `interval` while the trigger is active.
#[derive(Clone)]
pub struct ScheduledCallback {
    pub interval: Duration,
    pub callback: ScheduledFn,
}

/// What a `trigger` hook hands back on activation.
#[derive(Default)]
pub struct TriggerResponse {
    pub schedule: Option<ScheduledCallback>,
    pub teardown: Option<TeardownFn>,
    pub manual: Option<ManualFn>,
}

impl TriggerResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedule<F>(mut self, interval: Duration, callback: F) -> Self
    where
        F: Fn(TriggerEmitter) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync + 'static,
    {
        self.schedule = Some(ScheduledCallback {
            interval,
            callback: Arc::new(callback),
        });
        self
    }

    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    pub fn with_manual<F>(mut self, manual: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Vec<Item>, NodeError>> + Send + Sync + 'static,
    {
        self.manual = Some(Arc::new(manual));
        self
    }
}

impl fmt::Debug for TriggerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerResponse")
            .field("schedule", &self.schedule.as_ref().map(|s| s.interval))
            .field("teardown", &self.teardown.is_some())
            .field("manual", &self.manual.is_some())
            .finish()
    }
}
