//! Static node type metadata and the hook each type exposes.

use crate::{ExecutableNode, NodeVersion, PortSpec, SupplyDataNode, TriggerNode, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Static description of one version of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeDescription {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    pub version: NodeVersion,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub parameters: Vec<ParameterSpec>,
    pub lifecycle: VersionLifecycle,
}

impl NodeTypeDescription {
    pub fn new(name: impl Into<String>, version: impl Into<NodeVersion>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            description: String::new(),
            category: "general".to_string(),
            version: version.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
            lifecycle: VersionLifecycle::Active,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: VersionLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn has_item_stream_inputs(&self) -> bool {
        self.inputs.iter().any(PortSpec::is_item_stream)
    }
}

/// Status of one registered version. Every version stays resolvable; the tag
/// only controls what is offered for new nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionLifecycle {
    #[default]
    Active,
    Deprecated,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub display_name: String,
    pub kind: ParameterKind,
    pub default: Value,
    pub required: bool,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            kind,
            default: Value::Null,
            required: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Json,
    Options { values: Vec<String> },
}

/// The single hook a node type exposes.
#[derive(Clone)]
pub enum NodeBehavior {
    Execute(Arc<dyn ExecutableNode>),
    Trigger(Arc<dyn TriggerNode>),
    SupplyData(Arc<dyn SupplyDataNode>),
}

impl NodeBehavior {
    pub fn role(&self) -> NodeRole {
        match self {
            NodeBehavior::Execute(_) => NodeRole::Execute,
            NodeBehavior::Trigger(_) => NodeRole::Trigger,
            NodeBehavior::SupplyData(_) => NodeRole::SupplyData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Execute,
    Trigger,
    SupplyData,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Execute => f.write_str("execute"),
            NodeRole::Trigger => f.write_str("trigger"),
            NodeRole::SupplyData => f.write_str("supplyData"),
        }
    }
}

/// A registered node type version: its description plus its hook.
#[derive(Clone)]
pub struct NodeTypeDescriptor {
    pub description: NodeTypeDescription,
    pub behavior: NodeBehavior,
}

impl NodeTypeDescriptor {
    pub fn execute(description: NodeTypeDescription, node: impl ExecutableNode + 'static) -> Self {
        Self {
            description,
            behavior: NodeBehavior::Execute(Arc::new(node)),
        }
    }

    pub fn trigger(description: NodeTypeDescription, node: impl TriggerNode + 'static) -> Self {
        Self {
            description,
            behavior: NodeBehavior::Trigger(Arc::new(node)),
        }
    }

    pub fn supply_data(description: NodeTypeDescription, node: impl SupplyDataNode + 'static) -> Self {
        Self {
            description,
            behavior: NodeBehavior::SupplyData(Arc::new(node)),
        }
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn version(&self) -> NodeVersion {
        self.description.version
    }

    pub fn role(&self) -> NodeRole {
        self.behavior.role()
    }

    /// Structural checks applied when the descriptor is registered.
    pub fn validate(&self) -> Result<(), String> {
        let d = &self.description;
        if d.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        match self.role() {
            NodeRole::Trigger if !d.inputs.is_empty() => {
                Err("trigger nodes cannot declare inputs".to_string())
            }
            NodeRole::SupplyData if d.outputs.is_empty() => {
                Err("supply-data nodes must declare an output".to_string())
            }
            NodeRole::SupplyData if d.outputs.iter().any(PortSpec::is_item_stream) => {
                Err("supply-data nodes can only output capabilities".to_string())
            }
            NodeRole::Execute if d.outputs.is_empty() => {
                Err("execute nodes must declare at least one output".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for NodeTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTypeDescriptor")
            .field("name", &self.description.name)
            .field("version", &self.description.version)
            .field("role", &self.role())
            .finish()
    }
}
