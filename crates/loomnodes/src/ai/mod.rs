//! Capability suppliers and the agent that consumes them.
//!
//! Suppliers hand out trait objects wrapped in a [`Capability`]; consumers
//! recover them with [`handle`]. The model and tools here are deliberately
//! simple stand-ins for real provider clients.

mod agent;
mod memory;
mod model;
mod tools;

pub use agent::AgentNode;
pub use memory::{BufferMemory, BufferMemoryNode};
pub use model::{EchoModel, EchoModelNode};
pub use tools::{evaluate, Calculator, CalculatorNode, Clock, ToolkitNode};

use async_trait::async_trait;
use loomcore::{
    Capability, CapabilityError, ConnectionType, NodeError, NodeTypeDescription,
    NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec, VersionLifecycle,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Completion for a conversation, oldest message first.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, NodeError>;
}

#[async_trait]
pub trait ChatMemory: Send + Sync {
    async fn messages(&self) -> Vec<ChatMessage>;
    async fn append(&self, message: ChatMessage);
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn call(&self, input: &str) -> Result<String, NodeError>;
}

pub type SharedModel = Arc<dyn LanguageModel>;
pub type SharedMemory = Arc<dyn ChatMemory>;
pub type SharedTool = Arc<dyn Tool>;

/// Recover a shared handle of type `T` from a supplied capability.
pub fn handle<T: Any + Clone>(capability: &Capability) -> Result<T, CapabilityError> {
    capability
        .downcast_ref::<T>()
        .cloned()
        .ok_or(CapabilityError::Downcast {
            expected: std::any::type_name::<T>(),
        })
}

pub fn echo_model_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::supply_data(
        NodeTypeDescription::new("lm.echo", 1u32)
            .with_display_name("Echo Model")
            .with_description("Language model that repeats the latest user message")
            .with_category("ai")
            .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model"))
            .with_parameter(ParameterSpec::new("prefix", ParameterKind::String).with_default("echo: ")),
        EchoModelNode,
    )
}

pub fn buffer_memory_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::supply_data(
        NodeTypeDescription::new("memory.buffer", 1u32)
            .with_display_name("Window Buffer Memory")
            .with_description("Remembers the most recent messages of a run")
            .with_category("ai")
            .with_output(PortSpec::new(ConnectionType::Memory, "Memory"))
            .with_parameter(ParameterSpec::new("window", ParameterKind::Number).with_default(10i64)),
        BufferMemoryNode,
    )
}

pub fn calculator_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::supply_data(
        NodeTypeDescription::new("tool.calculator", 1u32)
            .with_display_name("Calculator")
            .with_description("Arithmetic tool for agents")
            .with_category("ai")
            .with_output(PortSpec::new(ConnectionType::Tool, "Tool")),
        CalculatorNode,
    )
}

pub fn toolkit_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::supply_data(
        NodeTypeDescription::new("toolkit.basic", 1u32)
            .with_display_name("Basic Toolkit")
            .with_description("Calculator and clock tools")
            .with_category("ai")
            .with_output(PortSpec::new(ConnectionType::Tool, "Tools")),
        ToolkitNode,
    )
}

/// Both versions of the agent. Version 1 predates memory support.
pub fn agent_descriptors() -> Vec<NodeTypeDescriptor> {
    let base = |version: u32| {
        NodeTypeDescription::new("agent.simple", version)
            .with_display_name("Agent")
            .with_description("Answers prompts with a model and tools")
            .with_category("ai")
            .with_input(PortSpec::main("Input"))
            .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model").required())
    };
    vec![
        NodeTypeDescriptor::execute(
            base(1)
                .with_input(PortSpec::new(ConnectionType::Tool, "Tools"))
                .with_output(PortSpec::main("Output"))
                .with_lifecycle(VersionLifecycle::Deprecated),
            AgentNode,
        ),
        NodeTypeDescriptor::execute(
            base(2)
                .with_input(PortSpec::new(ConnectionType::Memory, "Memory"))
                .with_input(PortSpec::new(ConnectionType::Tool, "Tools"))
                .with_output(PortSpec::main("Output"))
                .with_parameter(ParameterSpec::new("prompt", ParameterKind::String)),
            AgentNode,
        ),
    ]
}
