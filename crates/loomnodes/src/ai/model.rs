use super::{ChatMessage, LanguageModel, Role, SharedModel};
use async_trait::async_trait;
use loomcore::{NodeContext, NodeError, SupplyDataNode, SupplyResponse};
use std::sync::Arc;

/// Answers with the latest user message, prefixed.
#[derive(Debug, Clone)]
pub struct EchoModel {
    prefix: String,
}

impl EchoModel {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, NodeError> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| NodeError::MissingInput("user message".to_string()))?;
        Ok(format!("{}{}", self.prefix, last.content))
    }
}

pub struct EchoModelNode;

#[async_trait]
impl SupplyDataNode for EchoModelNode {
    async fn supply_data(&self, ctx: &NodeContext, _output_index: usize) -> Result<SupplyResponse, NodeError> {
        let prefix = ctx.get_parameter("prefix", 0, "echo: ");
        let model: SharedModel = Arc::new(EchoModel::new(prefix.as_str().unwrap_or("echo: ")));
        tracing::debug!(node_id = %ctx.node_id(), "Echo model constructed");
        Ok(SupplyResponse::single(model))
    }
}
