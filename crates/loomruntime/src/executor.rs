use crate::capability::{CapabilityCache, CapabilityResolver};
use crate::graph::{ConnectionGraph, ResolvedNode};
use crate::runtime::DEFAULT_CAPABILITY_DEPTH;
use chrono::Utc;
use loomcore::{
    EventBus, ExecutableNode, ExecutionEvent, ExecutionId, ExecutionMode, FlowError, Item,
    NodeBehavior, NodeError, NodeFailure, NodeId, NodeInput, NodeOutcome, NodeOutput,
    NodeRunRecord, ParameterResolver, PortRef, RunStatus, StaticParameters, Value, WorkflowError,
    WorkflowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Where a run begins and what it is fed with.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub node_id: NodeId,
    /// Items handed to the start node. For a trigger start node these become
    /// its output; for an execute node they arrive on its first input.
    pub items: Option<Vec<Item>>,
}

impl RunStart {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            items: None,
        }
    }

    pub fn with_items(mut self, items: Vec<Item>) -> Self {
        self.items = Some(items);
        self
    }
}

/// The node and item that aborted a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunError {
    pub node_id: NodeId,
    pub item_index: Option<usize>,
    pub error: NodeError,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_index {
            Some(index) => write!(f, "node {} failed on item {}: {}", self.node_id, index, self.error),
            None => write!(f, "node {} failed: {}", self.node_id, self.error),
        }
    }
}

/// Result of workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub outputs: HashMap<NodeId, NodeOutput>,
    pub error: Option<RunError>,
    pub skipped: Vec<NodeId>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn output(&self, node_id: NodeId) -> Option<&NodeOutput> {
        self.outputs.get(&node_id)
    }

    /// Items a node produced on one output; empty when it never ran.
    pub fn items(&self, node_id: NodeId, output: usize) -> &[Item] {
        self.outputs
            .get(&node_id)
            .map(|o| o.items(output))
            .unwrap_or(&[])
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Per-run state machine: `Pending -> Running -> {Completed, Failed, Cancelled}`.
struct RunState {
    execution_id: ExecutionId,
    status: RunStatus,
}

impl RunState {
    fn advance(&mut self, next: RunStatus) {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                target: "loom::consistency",
                execution_id = %self.execution_id,
                from = %self.status,
                to = %next,
                "Invalid run status transition"
            );
            return;
        }
        self.status = next;
    }
}

/// Runs one workflow graph sequentially along its item-stream order.
#[derive(Clone)]
pub struct WorkflowExecutor {
    max_capability_depth: usize,
    default_timeout_ms: Option<u64>,
    parameters: Arc<dyn ParameterResolver>,
}

impl WorkflowExecutor {
    pub fn new() -> Self {
        Self {
            max_capability_depth: DEFAULT_CAPABILITY_DEPTH,
            default_timeout_ms: None,
            parameters: Arc::new(StaticParameters),
        }
    }

    pub fn with_max_capability_depth(mut self, depth: usize) -> Self {
        self.max_capability_depth = depth;
        self
    }

    /// Timeout applied when the workflow settings do not set one.
    pub fn with_default_timeout_ms(mut self, millis: Option<u64>) -> Self {
        self.default_timeout_ms = millis;
        self
    }

    pub fn with_parameters(mut self, parameters: Arc<dyn ParameterResolver>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Execute one run and return its outcome.
    ///
    /// Only problems with the request itself (unknown or unsuitable start
    /// node) are returned as `Err`; node failures end the run as `Failed`.
    pub async fn execute(
        &self,
        graph: Arc<ConnectionGraph>,
        events: Arc<EventBus>,
        start: RunStart,
        mode: ExecutionMode,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        let start_node = graph
            .node(start.node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(start.node_id.to_string()))?;
        if matches!(start_node.behavior(), NodeBehavior::SupplyData(_)) {
            return Err(WorkflowError::InvalidStartNode(start.node_id).into());
        }
        let order = graph.item_stream_order(&[start.node_id])?;

        let execution_id = ExecutionId::new_v4();
        let workflow_id = graph.workflow_id();
        let started = Instant::now();
        let mut state = RunState {
            execution_id,
            status: RunStatus::Pending,
        };

        let cache = Arc::new(CapabilityCache::new());
        let resolver = CapabilityResolver::new(
            Arc::clone(&graph),
            Arc::clone(&cache),
            Arc::clone(&events),
            execution_id,
        )
        .with_mode(mode)
        .with_cancellation(cancellation.clone())
        .with_parameters(Arc::clone(&self.parameters))
        .with_max_depth(self.max_capability_depth);

        state.advance(RunStatus::Running);
        events.emit(ExecutionEvent::RunStarted {
            execution_id,
            workflow_id,
            start_node: start.node_id,
            mode,
            timestamp: Utc::now(),
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            nodes = order.len(),
            "Starting workflow run"
        );

        let mut outputs: HashMap<NodeId, NodeOutput> = HashMap::new();
        let mut skipped = Vec::new();
        let mut run_error = None;
        let mut start_items = start.items;

        for node_id in order {
            if cancellation.is_cancelled() {
                tracing::info!(execution_id = %execution_id, "Run cancelled before node {}", node_id);
                state.advance(RunStatus::Cancelled);
                break;
            }
            let Some(node) = graph.node(node_id) else {
                continue;
            };
            let is_start = node_id == start.node_id;

            let hook = match node.behavior() {
                NodeBehavior::Trigger(_) => {
                    let items = start_items
                        .take()
                        .unwrap_or_else(|| vec![Item::new(Value::Object(HashMap::new()))]);
                    outputs.insert(node_id, NodeOutput::from_items(items));
                    continue;
                }
                NodeBehavior::SupplyData(_) => continue,
                NodeBehavior::Execute(hook) => Arc::clone(hook),
            };

            let input = if is_start {
                NodeInput::from_items(start_items.take().unwrap_or_default())
            } else {
                gather_input(&graph, node, &outputs)
            };

            if !is_start && input.is_empty() {
                tracing::debug!(node_id = %node_id, "No items arrived, skipping node");
                events.emit(ExecutionEvent::NodeSkipped {
                    execution_id,
                    node_id,
                    timestamp: Utc::now(),
                });
                skipped.push(node_id);
                outputs.insert(node_id, NodeOutput::default());
                continue;
            }

            if node.instance.disabled {
                tracing::debug!(node_id = %node_id, "Node disabled, passing input through");
                outputs.insert(node_id, NodeOutput::from_items(input.into_items(0)));
                continue;
            }

            match self.invoke(&graph, node, hook, input, &resolver, &events).await {
                Ok(output) => {
                    outputs.insert(node_id, output);
                }
                Err(failure) => {
                    if failure.error == NodeError::Cancelled {
                        state.advance(RunStatus::Cancelled);
                        break;
                    }

                    if failure.error.is_internal() {
                        tracing::error!(
                            target: "loom::consistency",
                            node_id = %node_id,
                            error = %failure.error,
                            "Run aborted by an internal consistency error"
                        );
                    } else if node.instance.continue_on_fail {
                        tracing::warn!(
                            node_id = %node_id,
                            error = %failure,
                            "Node failed, continuing with an error item"
                        );
                        let mut output = failure.partial;
                        output.extend(NodeOutput::from_items(vec![Item::error(
                            failure.item_index.unwrap_or(0),
                            failure.error.to_string(),
                        )]));
                        outputs.insert(node_id, output);
                        continue;
                    }

                    tracing::error!(node_id = %node_id, error = %failure, "Node failed, aborting run");
                    if graph.settings().save_partial_output {
                        outputs.insert(node_id, failure.partial);
                    }
                    run_error = Some(RunError {
                        node_id,
                        item_index: failure.item_index,
                        error: failure.error,
                    });
                    state.advance(RunStatus::Failed);
                    break;
                }
            }
        }

        if state.status == RunStatus::Running {
            state.advance(RunStatus::Completed);
        }
        cache.close_all().await;

        let duration_ms = started.elapsed().as_millis() as u64;
        events.emit(ExecutionEvent::RunFinished {
            execution_id,
            workflow_id,
            status: state.status,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            execution_id = %execution_id,
            status = %state.status,
            "Workflow run finished in {}ms",
            duration_ms
        );

        Ok(ExecutionResult {
            execution_id,
            workflow_id,
            status: state.status,
            outputs,
            error: run_error,
            skipped,
            duration_ms,
        })
    }

    /// Invoke an execute hook, retrying per the node's policy.
    async fn invoke(
        &self,
        graph: &ConnectionGraph,
        node: &ResolvedNode,
        hook: Arc<dyn ExecutableNode>,
        input: NodeInput,
        resolver: &CapabilityResolver,
        events: &EventBus,
    ) -> Result<NodeOutput, NodeFailure> {
        let node_id = node.id();
        let node_type = node.instance.type_name.clone();
        let ctx = resolver.context_for(node, Vec::new());
        let execution_id = ctx.execution_id;
        let max_attempts = node
            .instance
            .retry
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1);
        let timeout_ms = graph.settings().node_timeout_ms.or(self.default_timeout_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;
            events.emit(ExecutionEvent::NodeStarted {
                execution_id,
                node_id,
                node_type: node_type.clone(),
                attempt,
                timestamp: Utc::now(),
            });
            tracing::debug!(node_id = %node_id, node_type = %node_type, attempt, "Executing node");

            let started_at = Utc::now();
            let clock = Instant::now();
            let call = hook.execute(&ctx, input.clone());
            let result = match timeout_ms {
                Some(millis) => match timeout(Duration::from_millis(millis), call).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeFailure::new(NodeError::Timeout { millis })),
                },
                None => call.await,
            };
            let elapsed_ms = clock.elapsed().as_millis() as u64;

            let outcome = match &result {
                Ok(output) => NodeOutcome::Items {
                    count: output.item_count(),
                },
                Err(failure) => NodeOutcome::Error {
                    message: failure.error.to_string(),
                    item_index: failure.item_index,
                },
            };
            events.emit(ExecutionEvent::NodeFinished {
                execution_id,
                record: NodeRunRecord {
                    node_id,
                    node_type: node_type.clone(),
                    attempt,
                    started_at,
                    finished_at: Utc::now(),
                    outcome,
                },
            });

            match result {
                Ok(mut output) => {
                    output.metadata.execution_time_ms = elapsed_ms;
                    output.metadata.attempts = attempt;
                    tracing::info!("Node {} completed in {}ms", node_id, elapsed_ms);
                    return Ok(output);
                }
                Err(failure)
                    if attempt < max_attempts
                        && !failure.error.is_internal()
                        && failure.error != NodeError::Cancelled
                        && !ctx.is_cancelled() =>
                {
                    let delay = node
                        .instance
                        .retry
                        .as_ref()
                        .map(|p| p.delay_before(attempt + 1))
                        .unwrap_or(0);
                    tracing::warn!(
                        node_id = %node_id,
                        attempt,
                        error = %failure,
                        "Node failed, retrying in {}ms",
                        delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(failure) => return Err(failure),
            }
        }
    }
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Items arriving on each item-stream input, concatenated in edge order.
fn gather_input(
    graph: &ConnectionGraph,
    node: &ResolvedNode,
    outputs: &HashMap<NodeId, NodeOutput>,
) -> NodeInput {
    let inputs = node
        .description
        .inputs
        .iter()
        .enumerate()
        .map(|(index, port)| {
            if !port.is_item_stream() {
                return Vec::new();
            }
            graph
                .incoming(PortRef::new(node.id(), index))
                .into_iter()
                .flat_map(|edge| {
                    outputs
                        .get(&edge.source.node_id)
                        .map(|o| o.items(edge.source.index).to_vec())
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();
    NodeInput::new(inputs)
}
