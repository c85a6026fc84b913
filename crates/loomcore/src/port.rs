//! Port declarations on node types.

use crate::{ConnectionType, MaxConnections, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed attachment point declared by a node type.
///
/// Port specs are fixed at registration time; a node instance addresses them
/// by their position in the type's `inputs` or `outputs` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub connection_type: ConnectionType,
    pub display_name: String,
    pub required: bool,
    pub max_connections: MaxConnections,
}

impl PortSpec {
    /// Port with the connection type's default cardinality.
    pub fn new(connection_type: ConnectionType, display_name: impl Into<String>) -> Self {
        Self {
            connection_type,
            display_name: display_name.into(),
            required: false,
            max_connections: connection_type.standard_info().default_max_connections,
        }
    }

    /// Ordinary item-stream port.
    pub fn main(display_name: impl Into<String>) -> Self {
        Self::new(ConnectionType::Main, display_name)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_max_connections(mut self, max: MaxConnections) -> Self {
        self.max_connections = max;
        self
    }

    pub fn is_item_stream(&self) -> bool {
        self.connection_type.is_item_stream()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortDirection::Input => "input",
            PortDirection::Output => "output",
        }
    }
}

/// One concrete port of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node_id: NodeId,
    pub index: usize,
}

impl PortRef {
    pub fn new(node_id: NodeId, index: usize) -> Self {
        Self { node_id, index }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node_id, self.index)
    }
}
