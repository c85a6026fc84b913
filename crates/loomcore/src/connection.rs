//! Port kinds and the rules attached to each of them.
//!
//! Every port carries exactly one [`ConnectionType`]. `Main` ports carry item
//! streams that are pushed downstream; all other types carry capabilities that
//! the consumer pulls lazily from its suppliers.

use crate::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "ai_languageModel")]
    LanguageModel,
    #[serde(rename = "ai_tool")]
    Tool,
    #[serde(rename = "ai_document")]
    Document,
    #[serde(rename = "ai_textSplitter")]
    TextSplitter,
    #[serde(rename = "ai_vectorStore")]
    VectorStore,
    #[serde(rename = "ai_retriever")]
    Retriever,
    #[serde(rename = "ai_outputParser")]
    OutputParser,
    #[serde(rename = "ai_memory")]
    Memory,
    #[serde(rename = "ai_embedding")]
    Embedding,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 10] = [
        ConnectionType::Main,
        ConnectionType::LanguageModel,
        ConnectionType::Tool,
        ConnectionType::Document,
        ConnectionType::TextSplitter,
        ConnectionType::VectorStore,
        ConnectionType::Retriever,
        ConnectionType::OutputParser,
        ConnectionType::Memory,
        ConnectionType::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Main => "main",
            ConnectionType::LanguageModel => "ai_languageModel",
            ConnectionType::Tool => "ai_tool",
            ConnectionType::Document => "ai_document",
            ConnectionType::TextSplitter => "ai_textSplitter",
            ConnectionType::VectorStore => "ai_vectorStore",
            ConnectionType::Retriever => "ai_retriever",
            ConnectionType::OutputParser => "ai_outputParser",
            ConnectionType::Memory => "ai_memory",
            ConnectionType::Embedding => "ai_embedding",
        }
    }

    pub fn is_item_stream(&self) -> bool {
        matches!(self, ConnectionType::Main)
    }

    /// Built-in rule for this type.
    pub fn standard_info(&self) -> ConnectionTypeInfo {
        match self {
            ConnectionType::Main => ConnectionTypeInfo {
                kind: ConnectionKind::ItemStream,
                default_max_connections: MaxConnections::Unbounded,
                flow: DataFlow::Push,
            },
            // A consumer may aggregate any number of tools and documents.
            ConnectionType::Tool | ConnectionType::Document => ConnectionTypeInfo {
                kind: ConnectionKind::Capability,
                default_max_connections: MaxConnections::Unbounded,
                flow: DataFlow::Pull,
            },
            _ => ConnectionTypeInfo {
                kind: ConnectionKind::Capability,
                default_max_connections: MaxConnections::Limited(1),
                flow: DataFlow::Pull,
            },
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownConnectionType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    ItemStream,
    Capability,
}

/// How values move across an edge of a given type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFlow {
    /// The producer runs first and its items are pushed to the consumer.
    Push,
    /// The consumer asks for the value; the producer is constructed on demand.
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxConnections {
    Unbounded,
    Limited(usize),
}

impl MaxConnections {
    pub fn allows(&self, count: usize) -> bool {
        match self {
            MaxConnections::Unbounded => true,
            MaxConnections::Limited(max) => count <= *max,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            MaxConnections::Unbounded => None,
            MaxConnections::Limited(max) => Some(*max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTypeInfo {
    pub kind: ConnectionKind,
    pub default_max_connections: MaxConnections,
    pub flow: DataFlow,
}

/// Read-only table of the connection types known to this process.
#[derive(Debug, Clone)]
pub struct ConnectionTypeRegistry {
    types: HashMap<ConnectionType, ConnectionTypeInfo>,
}

impl ConnectionTypeRegistry {
    /// Registry holding every built-in connection type.
    pub fn standard() -> Self {
        Self::from_types(ConnectionType::ALL)
    }

    /// Registry restricted to the given types, with their built-in rules.
    pub fn from_types(types: impl IntoIterator<Item = ConnectionType>) -> Self {
        Self {
            types: types.into_iter().map(|t| (t, t.standard_info())).collect(),
        }
    }

    pub fn describe(&self, connection_type: ConnectionType) -> Result<ConnectionTypeInfo, RegistryError> {
        self.types
            .get(&connection_type)
            .copied()
            .ok_or_else(|| RegistryError::UnknownConnectionType(connection_type.to_string()))
    }

    pub fn describe_name(&self, name: &str) -> Result<ConnectionTypeInfo, RegistryError> {
        self.describe(name.parse()?)
    }

    pub fn is_registered(&self, connection_type: ConnectionType) -> bool {
        self.types.contains_key(&connection_type)
    }
}

impl Default for ConnectionTypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
