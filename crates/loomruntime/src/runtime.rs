use crate::executor::{ExecutionResult, RunStart, WorkflowExecutor};
use crate::graph::ConnectionGraph;
use crate::registry::NodeTypeRegistry;
use crate::trigger::{RunSpawner, TriggerManager, TriggerState};
use loomcore::{
    ActivationMode, ConnectionTypeRegistry, EventBus, ExecutionEvent, ExecutionMode, FlowError,
    NodeId, Workflow, WorkflowError, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Nesting limit of capability sub-trees.
pub const DEFAULT_CAPABILITY_DEPTH: usize = 32;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub max_capability_depth: usize,
    pub default_node_timeout_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.event_buffer_size == 0 {
            return Err(FlowError::Config("event_buffer_size must be at least 1".into()));
        }
        if self.max_capability_depth == 0 {
            return Err(FlowError::Config("max_capability_depth must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_capability_depth: DEFAULT_CAPABILITY_DEPTH,
            default_node_timeout_ms: None,
        }
    }
}

/// A workflow together with everything built for it at load time.
struct LoadedWorkflow {
    workflow: Workflow,
    graph: Arc<ConnectionGraph>,
    triggers: Arc<TriggerManager>,
    shutdown: CancellationToken,
}

/// Main runtime: owns the registries, the loaded workflows and their triggers
pub struct LoomRuntime {
    registry: Arc<NodeTypeRegistry>,
    connection_types: Arc<ConnectionTypeRegistry>,
    executor: WorkflowExecutor,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, LoadedWorkflow>>>,
    config: RuntimeConfig,
}

impl LoomRuntime {
    /// Create a runtime around a populated registry with default settings
    pub fn new(registry: NodeTypeRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: NodeTypeRegistry, config: RuntimeConfig) -> Self {
        Self::with_registries(
            Arc::new(registry),
            Arc::new(ConnectionTypeRegistry::standard()),
            config,
        )
    }

    pub fn with_registries(
        registry: Arc<NodeTypeRegistry>,
        connection_types: Arc<ConnectionTypeRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let executor = WorkflowExecutor::new()
            .with_max_capability_depth(config.max_capability_depth)
            .with_default_timeout_ms(config.default_node_timeout_ms);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            connection_types,
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeTypeRegistry> {
        &self.registry
    }

    pub fn connection_types(&self) -> &Arc<ConnectionTypeRegistry> {
        &self.connection_types
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build and validate the connection graph of a workflow without loading it.
    pub fn validate(&self, workflow: &Workflow) -> Result<ConnectionGraph, FlowError> {
        Ok(ConnectionGraph::from_workflow(
            workflow,
            &self.registry,
            &self.connection_types,
        )?)
    }

    /// Load a workflow, replacing any earlier definition with the same id.
    ///
    /// Triggers that were active on the replaced definition are re-activated
    /// on the new one in `Update` mode.
    pub async fn load_workflow(&self, workflow: Workflow) -> Result<WorkflowId, FlowError> {
        let graph = Arc::new(self.validate(&workflow)?);
        let workflow_id = workflow.id;
        let shutdown = CancellationToken::new();
        let sink = RunSpawner::new(
            self.executor.clone(),
            Arc::clone(&graph),
            Arc::clone(&self.event_bus),
            shutdown.clone(),
        );
        let triggers = Arc::new(TriggerManager::new(
            Arc::clone(&graph),
            Arc::clone(&self.event_bus),
            Arc::new(sink),
        ));

        let previous = {
            let mut workflows = self.workflows.write().await;
            workflows.insert(
                workflow_id,
                LoadedWorkflow {
                    workflow,
                    graph,
                    triggers: Arc::clone(&triggers),
                    shutdown,
                },
            )
        };

        if let Some(previous) = previous {
            let reactivate = previous.triggers.active_triggers().await;
            previous.triggers.deactivate_all().await;
            previous.shutdown.cancel();
            for node_id in reactivate {
                if triggers.state(node_id).await == TriggerState::Inactive
                    && triggers.is_trigger(node_id)
                {
                    triggers.activate(node_id, ActivationMode::Update).await?;
                }
            }
            tracing::info!(workflow_id = %workflow_id, "Workflow reloaded");
        } else {
            tracing::info!(workflow_id = %workflow_id, "Workflow loaded");
        }
        Ok(workflow_id)
    }

    /// Unload a workflow, deactivating its triggers and cancelling its triggered runs.
    pub async fn unload_workflow(&self, workflow_id: WorkflowId) -> Result<(), FlowError> {
        let loaded = self
            .workflows
            .write()
            .await
            .remove(&workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        loaded.triggers.deactivate_all().await;
        loaded.shutdown.cancel();
        tracing::info!(workflow_id = %workflow_id, "Workflow unloaded");
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        let workflows = self.workflows.read().await;
        workflows.get(&workflow_id).map(|w| w.workflow.clone())
    }

    pub async fn graph(&self, workflow_id: WorkflowId) -> Result<Arc<ConnectionGraph>, FlowError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(&workflow_id)
            .map(|w| Arc::clone(&w.graph))
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()).into())
    }

    /// Trigger manager of a loaded workflow
    pub async fn triggers(&self, workflow_id: WorkflowId) -> Result<Arc<TriggerManager>, FlowError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(&workflow_id)
            .map(|w| Arc::clone(&w.triggers))
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()).into())
    }

    /// Activate every trigger of a loaded workflow.
    pub async fn activate(&self, workflow_id: WorkflowId, mode: ActivationMode) -> Result<(), FlowError> {
        let triggers = self.triggers(workflow_id).await?;
        triggers.activate_all(mode).await?;
        Ok(())
    }

    pub async fn deactivate(&self, workflow_id: WorkflowId) -> Result<(), FlowError> {
        let triggers = self.triggers(workflow_id).await?;
        triggers.deactivate_all().await;
        Ok(())
    }

    /// Run a loaded workflow from `start` in manual mode.
    pub async fn execute(&self, workflow_id: WorkflowId, start: RunStart) -> Result<ExecutionResult, FlowError> {
        self.execute_with(workflow_id, start, ExecutionMode::Manual, CancellationToken::new())
            .await
    }

    pub async fn execute_with(
        &self,
        workflow_id: WorkflowId,
        start: RunStart,
        mode: ExecutionMode,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        let graph = self.graph(workflow_id).await?;
        self.executor
            .execute(graph, Arc::clone(&self.event_bus), start, mode, cancellation)
            .await
    }

    /// Execute a workflow directly (without loading it)
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        start: RunStart,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult, FlowError> {
        let graph = Arc::new(self.validate(workflow)?);
        self.executor
            .execute(graph, Arc::clone(&self.event_bus), start, mode, CancellationToken::new())
            .await
    }

    /// Invoke a trigger's manual routine and run the workflow with what it produced.
    pub async fn invoke_trigger_manually(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
    ) -> Result<ExecutionResult, FlowError> {
        let triggers = self.triggers(workflow_id).await?;
        let items = triggers.invoke_manually(node_id).await?;
        self.execute_with(
            workflow_id,
            RunStart::new(node_id).with_items(items),
            ExecutionMode::Manual,
            CancellationToken::new(),
        )
        .await
    }

    /// Deactivate and unload everything.
    pub async fn shutdown(&self) {
        let loaded: Vec<LoadedWorkflow> = {
            let mut workflows = self.workflows.write().await;
            workflows.drain().map(|(_, w)| w).collect()
        };
        for workflow in loaded {
            workflow.triggers.deactivate_all().await;
            workflow.shutdown.cancel();
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_fills_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"max_capability_depth": 4}"#).unwrap();
        assert_eq!(config.max_capability_depth, 4);
        assert_eq!(config.event_buffer_size, 1000);
        assert!(config.default_node_timeout_ms.is_none());
    }

    #[test]
    fn config_file_rejects_empty_event_buffer() {
        let path = std::env::temp_dir().join(format!("loom-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"event_buffer_size": 0}"#).unwrap();
        let err = RuntimeConfig::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[tokio::test]
    async fn zero_event_buffer_does_not_panic() {
        let config = RuntimeConfig {
            event_buffer_size: 0,
            ..RuntimeConfig::default()
        };
        let runtime = LoomRuntime::with_config(NodeTypeRegistry::new(), config);
        let _events = runtime.subscribe_events();
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let runtime = LoomRuntime::new(NodeTypeRegistry::new());
        let err = runtime
            .execute(WorkflowId::new_v4(), RunStart::new(NodeId::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Workflow(WorkflowError::NotFound(_))));
    }
}
