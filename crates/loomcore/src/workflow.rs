use crate::{Value, VersionRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

/// Complete workflow definition as handed over by the workflow loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeInstance>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeInstance) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Wire output `source_output` of one node to input `target_input` of another.
    pub fn connect(
        &mut self,
        source_node: NodeId,
        source_output: usize,
        target_node: NodeId,
        target_input: usize,
    ) {
        self.connections.push(Connection {
            source_node,
            source_output,
            target_node,
            target_input,
        });
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeInstance> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<&NodeInstance> {
        self.nodes.iter().find(|n| n.name.as_deref() == Some(name))
    }
}

/// A node as placed in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub type_version: VersionRequest,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub continue_on_fail: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeInstance {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_name: type_name.into(),
            type_version: VersionRequest::Latest,
            name: None,
            parameters: HashMap::new(),
            disabled: false,
            continue_on_fail: false,
            retry: None,
            position: None,
        }
    }

    pub fn with_version(mut self, version: VersionRequest) -> Self {
        self.type_version = version;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn continue_on_fail(mut self, enabled: bool) -> Self {
        self.continue_on_fail = enabled;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Name for logs: the user-facing name if set, otherwise the id.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Raw edge definition: output `source_output` of `source_node` feeds
/// input `target_input` of `target_node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source_node: NodeId,
    #[serde(default)]
    pub source_output: usize,
    pub target_node: NodeId,
    #[serde(default)]
    pub target_input: usize,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Retry policy for node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based; the first retry is attempt 2).
    pub fn delay_before(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(2) as i32;
        (self.delay_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Per-node invocation timeout.
    #[serde(default)]
    pub node_timeout_ms: Option<u64>,
    /// Keep the output a node produced before failing in the run data.
    #[serde(default = "default_true")]
    pub save_partial_output: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            node_timeout_ms: None,
            save_partial_output: true,
        }
    }
}
