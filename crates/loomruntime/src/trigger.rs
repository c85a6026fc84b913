//! Activation, manual invocation and teardown of trigger nodes.

use crate::executor::{RunStart, WorkflowExecutor};
use crate::graph::{ConnectionGraph, ResolvedNode};
use chrono::Utc;
use loomcore::{
    ActivationMode, EmitSink, EventBus, ExecutionEvent, ExecutionMode, Item, ManualFn,
    NodeBehavior, NodeId, ParameterResolver, ScheduledCallback, StaticParameters, TeardownFn,
    TriggerContext, TriggerEmitter, TriggerError, TriggerResponse,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerState::Inactive => "inactive",
            TriggerState::Activating => "activating",
            TriggerState::Active => "active",
            TriggerState::Deactivating => "deactivating",
        };
        f.write_str(s)
    }
}

/// What an activated trigger leaves behind.
struct TriggerHandle {
    teardown: Option<TeardownFn>,
    manual: Option<ManualFn>,
    schedule: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TriggerHandle {
    /// Stop the scheduled callback, then run the teardown routine.
    async fn release(mut self) {
        if let Some((token, task)) = self.schedule.take() {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!("Scheduled trigger task ended abnormally: {}", e);
            }
        }
        if let Some(teardown) = self.teardown.take() {
            teardown().await;
        }
    }
}

#[derive(Default)]
struct Slots {
    states: HashMap<NodeId, TriggerState>,
    handles: HashMap<NodeId, TriggerHandle>,
    /// Deactivations requested while the hook was still running.
    pending_release: HashSet<NodeId>,
}

impl Slots {
    fn state(&self, node_id: NodeId) -> TriggerState {
        self.states
            .get(&node_id)
            .copied()
            .unwrap_or(TriggerState::Inactive)
    }
}

/// Owns the trigger handles of one loaded workflow.
pub struct TriggerManager {
    graph: Arc<ConnectionGraph>,
    events: Arc<EventBus>,
    sink: Arc<dyn EmitSink>,
    parameters: Arc<dyn ParameterResolver>,
    slots: Mutex<Slots>,
}

impl TriggerManager {
    pub fn new(graph: Arc<ConnectionGraph>, events: Arc<EventBus>, sink: Arc<dyn EmitSink>) -> Self {
        Self {
            graph,
            events,
            sink,
            parameters: Arc::new(StaticParameters),
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn with_parameters(mut self, parameters: Arc<dyn ParameterResolver>) -> Self {
        self.parameters = parameters;
        self
    }

    pub async fn state(&self, node_id: NodeId) -> TriggerState {
        self.slots.lock().await.state(node_id)
    }

    /// Triggers currently holding a handle.
    pub async fn active_triggers(&self) -> Vec<NodeId> {
        let slots = self.slots.lock().await;
        self.graph
            .trigger_nodes()
            .into_iter()
            .map(|n| n.id())
            .filter(|id| slots.state(*id) == TriggerState::Active)
            .collect()
    }

    /// Whether `node_id` names a trigger node of this workflow.
    pub fn is_trigger(&self, node_id: NodeId) -> bool {
        self.trigger_node(node_id).is_ok()
    }

    fn trigger_node(&self, node_id: NodeId) -> Result<&ResolvedNode, TriggerError> {
        let node = self
            .graph
            .node(node_id)
            .ok_or(TriggerError::NodeNotFound(node_id))?;
        match node.behavior() {
            NodeBehavior::Trigger(_) => Ok(node),
            _ => Err(TriggerError::NotATrigger(node_id)),
        }
    }

    async fn call_hook(
        &self,
        node: &ResolvedNode,
        mode: ActivationMode,
    ) -> Result<TriggerResponse, TriggerError> {
        let NodeBehavior::Trigger(hook) = node.behavior() else {
            return Err(TriggerError::NotATrigger(node.id()));
        };
        let ctx = TriggerContext::new(
            Arc::clone(&node.instance),
            Arc::clone(&node.description),
            self.graph.workflow_id(),
            mode,
            self.events.create_emitter(None, node.id()),
            TriggerEmitter::new(node.id(), Arc::clone(&self.sink)),
        )
        .with_parameters(Arc::clone(&self.parameters));

        hook.trigger(&ctx)
            .await
            .map_err(|e| TriggerError::ActivationFailed {
                node_id: node.id(),
                reason: e.to_string(),
            })
    }

    /// Start a trigger: `Inactive -> Activating -> Active`.
    pub async fn activate(&self, node_id: NodeId, mode: ActivationMode) -> Result<(), TriggerError> {
        let node = self.trigger_node(node_id)?;
        if node.instance.disabled {
            tracing::debug!(node_id = %node_id, "Trigger disabled, not activating");
            return Ok(());
        }

        {
            let mut slots = self.slots.lock().await;
            let current = slots.state(node_id);
            if current != TriggerState::Inactive {
                return Err(TriggerError::InvalidTransition {
                    node_id,
                    from: current.to_string(),
                    to: TriggerState::Activating.to_string(),
                });
            }
            slots.states.insert(node_id, TriggerState::Activating);
        }

        let response = match self.call_hook(node, mode).await {
            Ok(response) => response,
            Err(e) => {
                let mut slots = self.slots.lock().await;
                slots.states.remove(&node_id);
                slots.pending_release.remove(&node_id);
                drop(slots);
                tracing::error!(node_id = %node_id, error = %e, "Trigger activation failed");
                return Err(e);
            }
        };

        let schedule = response
            .schedule
            .map(|schedule| self.spawn_schedule(node_id, schedule));
        let handle = TriggerHandle {
            teardown: response.teardown,
            manual: response.manual,
            schedule,
        };

        let released = {
            let mut slots = self.slots.lock().await;
            if slots.pending_release.remove(&node_id) {
                slots.states.insert(node_id, TriggerState::Deactivating);
                Some(handle)
            } else {
                slots.handles.insert(node_id, handle);
                slots.states.insert(node_id, TriggerState::Active);
                None
            }
        };

        if let Some(handle) = released {
            tracing::info!(node_id = %node_id, "Trigger deactivated while activating, releasing");
            self.finish_deactivation(node_id, handle).await;
            return Ok(());
        }

        self.events.emit(ExecutionEvent::TriggerActivated {
            workflow_id: self.graph.workflow_id(),
            node_id,
            mode,
            timestamp: Utc::now(),
        });
        tracing::info!(node_id = %node_id, mode = %mode, "Trigger activated");
        Ok(())
    }

    fn spawn_schedule(
        &self,
        node_id: NodeId,
        schedule: ScheduledCallback,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let stop = token.clone();
        let emitter = TriggerEmitter::new(node_id, Arc::clone(&self.sink));
        let ScheduledCallback { interval, callback } = schedule;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = callback(emitter.clone()) => {
                        if let Err(e) = result {
                            tracing::warn!(node_id = %node_id, error = %e, "Scheduled trigger callback failed");
                        }
                    }
                }
            }
            tracing::debug!(node_id = %node_id, "Scheduled trigger callback stopped");
        });
        (token, task)
    }

    /// Stop a trigger and run its teardown exactly once.
    ///
    /// Calling this on a trigger that is not active is a no-op. A trigger
    /// still activating is released as soon as its hook returns.
    pub async fn deactivate(&self, node_id: NodeId) -> Result<(), TriggerError> {
        let handle = {
            let mut slots = self.slots.lock().await;
            match slots.state(node_id) {
                TriggerState::Inactive | TriggerState::Deactivating => {
                    tracing::debug!(node_id = %node_id, "Trigger not active, nothing to deactivate");
                    return Ok(());
                }
                TriggerState::Activating => {
                    tracing::debug!(node_id = %node_id, "Trigger still activating, deferring release");
                    slots.pending_release.insert(node_id);
                    return Ok(());
                }
                TriggerState::Active => {
                    slots.states.insert(node_id, TriggerState::Deactivating);
                    slots.handles.remove(&node_id)
                }
            }
        };

        match handle {
            Some(handle) => self.finish_deactivation(node_id, handle).await,
            None => {
                self.slots.lock().await.states.remove(&node_id);
            }
        }
        Ok(())
    }

    /// Release a handle taken out of the slots and return the trigger to `Inactive`.
    async fn finish_deactivation(&self, node_id: NodeId, handle: TriggerHandle) {
        handle.release().await;
        self.slots.lock().await.states.remove(&node_id);

        self.events.emit(ExecutionEvent::TriggerDeactivated {
            workflow_id: self.graph.workflow_id(),
            node_id,
            timestamp: Utc::now(),
        });
        tracing::info!(node_id = %node_id, "Trigger deactivated");
    }

    /// Run a trigger's manual routine whatever its activation state.
    ///
    /// An inactive trigger is set up transiently in `Manual` mode and torn
    /// down again afterwards; its activation state never changes.
    pub async fn invoke_manually(&self, node_id: NodeId) -> Result<Vec<Item>, TriggerError> {
        let node = self.trigger_node(node_id)?;

        let existing = {
            let slots = self.slots.lock().await;
            match slots.state(node_id) {
                TriggerState::Active => Some(slots.handles.get(&node_id).and_then(|h| h.manual.clone())),
                TriggerState::Inactive => None,
                other => {
                    return Err(TriggerError::InvalidTransition {
                        node_id,
                        from: other.to_string(),
                        to: "manual".to_string(),
                    })
                }
            }
        };

        let (manual, transient) = match existing {
            Some(manual) => (manual, None),
            None => {
                tracing::debug!(node_id = %node_id, "Setting up inactive trigger for manual invocation");
                let response = self.call_hook(node, ActivationMode::Manual).await?;
                let manual = response.manual.clone();
                let handle = TriggerHandle {
                    teardown: response.teardown,
                    manual: response.manual,
                    schedule: None,
                };
                (manual, Some(handle))
            }
        };

        let result = match manual {
            Some(manual) => manual().await.map_err(|source| TriggerError::Invocation { node_id, source }),
            None => Err(TriggerError::NoManualRoutine(node_id)),
        };

        if let Some(handle) = transient {
            handle.release().await;
        }

        let items = result?;
        self.events.emit(ExecutionEvent::TriggerEmitted {
            workflow_id: self.graph.workflow_id(),
            node_id,
            item_count: items.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(node_id = %node_id, items = items.len(), "Trigger invoked manually");
        Ok(items)
    }

    /// Activate every enabled trigger of the workflow. Stops at the first failure.
    pub async fn activate_all(&self, mode: ActivationMode) -> Result<(), TriggerError> {
        for node_id in self.graph.trigger_nodes().into_iter().map(|n| n.id()) {
            if self.state(node_id).await == TriggerState::Inactive {
                self.activate(node_id, mode).await?;
            }
        }
        Ok(())
    }

    pub async fn deactivate_all(&self) {
        for node_id in self.graph.trigger_nodes().into_iter().map(|n| n.id()) {
            if let Err(e) = self.deactivate(node_id).await {
                tracing::warn!(node_id = %node_id, error = %e, "Failed to deactivate trigger");
            }
        }
    }
}

/// Turns each trigger emission into an independent run of the workflow.
///
/// Emissions are not serialized: every one is spawned as its own task.
pub struct RunSpawner {
    executor: WorkflowExecutor,
    graph: Arc<ConnectionGraph>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl RunSpawner {
    pub fn new(
        executor: WorkflowExecutor,
        graph: Arc<ConnectionGraph>,
        events: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            graph,
            events,
            shutdown,
        }
    }
}

impl EmitSink for RunSpawner {
    fn emit(&self, node_id: NodeId, items: Vec<Item>) {
        self.events.emit(ExecutionEvent::TriggerEmitted {
            workflow_id: self.graph.workflow_id(),
            node_id,
            item_count: items.len(),
            timestamp: Utc::now(),
        });

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(node_id = %node_id, "Trigger emitted outside of a tokio runtime, dropping items");
            return;
        };

        let executor = self.executor.clone();
        let graph = Arc::clone(&self.graph);
        let events = Arc::clone(&self.events);
        let cancellation = self.shutdown.child_token();
        runtime.spawn(async move {
            let start = RunStart::new(node_id).with_items(items);
            match executor
                .execute(graph, events, start, ExecutionMode::Trigger, cancellation)
                .await
            {
                Ok(result) => tracing::debug!(
                    node_id = %node_id,
                    execution_id = %result.execution_id,
                    status = %result.status,
                    "Triggered run finished"
                ),
                Err(e) => tracing::error!(node_id = %node_id, error = %e, "Triggered run could not start"),
            }
        });
    }
}
