use crate::{ConnectionType, NodeId, NodeOutput, NodeVersion};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Graph validation error: {0}")]
    Graph(#[from] GraphError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl NodeError {
    /// Errors that signal a broken graph invariant rather than a user or node problem.
    /// These abort the run even when the node continues on failure.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            NodeError::Capability(
                CapabilityError::MissingCapability { .. } | CapabilityError::InvariantViolation(_)
            )
        )
    }
}

/// A failed hook invocation.
///
/// `partial` carries whatever the node produced before the failing item so the
/// dispatcher can keep it in the run data.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub error: NodeError,
    pub item_index: Option<usize>,
    pub partial: NodeOutput,
}

impl NodeFailure {
    pub fn new(error: NodeError) -> Self {
        Self {
            error,
            item_index: None,
            partial: NodeOutput::default(),
        }
    }

    pub fn at_item(mut self, item_index: usize) -> Self {
        self.item_index = Some(item_index);
        self
    }

    pub fn with_partial(mut self, partial: NodeOutput) -> Self {
        self.partial = partial;
        self
    }
}

impl From<NodeError> for NodeFailure {
    fn from(error: NodeError) -> Self {
        NodeFailure::new(error)
    }
}

impl From<CapabilityError> for NodeFailure {
    fn from(error: CapabilityError) -> Self {
        NodeFailure::new(NodeError::Capability(error))
    }
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_index {
            Some(index) => write!(f, "{} (item {})", self.error, index),
            None => write!(f, "{}", self.error),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {0} is not a valid start node")]
    InvalidStartNode(NodeId),
}

/// Registration and resolution failures of the node type registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Node type '{name}' already has version {version} registered")]
    DuplicateVersion { name: String, version: NodeVersion },

    #[error("Node type '{name}' has no version matching {requested} (available: {available:?})")]
    UnsupportedNodeVersion {
        name: String,
        requested: String,
        available: Vec<NodeVersion>,
    },

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Unknown connection type: {0}")]
    UnknownConnectionType(String),

    #[error("Invalid descriptor for '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
}

/// Structural problems found while building a connection graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Item-stream edges form a cycle through nodes {nodes:?}")]
    Cyclic { nodes: Vec<NodeId> },

    #[error(
        "Connection type mismatch on edge {source_node}[{source_output}] -> {target_node}[{target_input}]: \
         output carries {source_type}, input expects {target_type}"
    )]
    TypeMismatch {
        source_node: NodeId,
        source_output: usize,
        target_node: NodeId,
        target_input: usize,
        source_type: ConnectionType,
        target_type: ConnectionType,
    },

    #[error("Input {input} of node {node_id} accepts at most {max} connection(s)")]
    CardinalityExceeded {
        node_id: NodeId,
        input: usize,
        max: usize,
    },

    #[error("Required {connection_type} input {input} of node {node_id} has no supplier")]
    MissingRequiredCapability {
        node_id: NodeId,
        input: usize,
        connection_type: ConnectionType,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node id {0} is used more than once")]
    DuplicateNode(NodeId),

    #[error("Node {node_id} has no {direction} port at index {index}")]
    PortNotFound {
        node_id: NodeId,
        direction: &'static str,
        index: usize,
    },

    #[error("Node {0} declares item-stream inputs but none are connected")]
    NoItemInput(NodeId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Node {consumer} has no supplier bound to capability input {input}")]
    MissingCapability { consumer: NodeId, input: usize },

    #[error("Input {input} of node {node_id} is not a capability port")]
    NotACapabilityPort { node_id: NodeId, input: usize },

    #[error("Node {consumer} has no input of type {connection_type}")]
    NoSuchInput {
        consumer: NodeId,
        connection_type: ConnectionType,
    },

    #[error("Node {0} does not supply data")]
    NotASupplier(NodeId),

    #[error("Capability resolution re-entered itself: {path:?}")]
    Cycle { path: Vec<NodeId> },

    #[error("Capability resolution exceeded depth limit {limit}")]
    DepthExceeded { limit: usize },

    #[error("Capability invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Supplier {node} failed: {source}")]
    Supply {
        node: NodeId,
        #[source]
        source: Box<NodeError>,
    },

    #[error("Supplied capability is not a {expected}")]
    Downcast { expected: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("Node {0} is not a trigger")]
    NotATrigger(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Activation of trigger {node_id} failed: {reason}")]
    ActivationFailed { node_id: NodeId, reason: String },

    #[error("Trigger {node_id} cannot go from {from} to {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: String,
        to: String,
    },

    #[error("Trigger {0} has no manual invocation routine")]
    NoManualRoutine(NodeId),

    #[error("Manual invocation of trigger {node_id} failed: {source}")]
    Invocation {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },
}
