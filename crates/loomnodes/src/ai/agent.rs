use super::{handle, ChatMessage, SharedMemory, SharedModel, SharedTool};
use async_trait::async_trait;
use loomcore::{
    ConnectionType, ExecutableNode, Item, NodeContext, NodeError, NodeFailure, NodeInput,
    NodeOutput, Value,
};
use std::collections::HashMap;

/// Answers one prompt per item using a model, an optional memory and any
/// number of tools.
///
/// A prompt of the form `/<tool> <input>` calls the named tool directly;
/// anything else goes to the model together with the remembered history.
pub struct AgentNode;

struct Equipment {
    model: SharedModel,
    memory: Option<SharedMemory>,
    tools: Vec<SharedTool>,
}

impl AgentNode {
    async fn equip(ctx: &NodeContext) -> Result<Equipment, NodeError> {
        let model = ctx.capability_of(ConnectionType::LanguageModel).await?;
        let model = model
            .as_single()
            .ok_or_else(|| NodeError::Configuration("expected a single language model".to_string()))
            .and_then(|c| handle::<SharedModel>(c).map_err(NodeError::from))?;

        let memory = match ctx.input_index(ConnectionType::Memory) {
            Some(input) => match ctx.optional_capability(input).await? {
                Some(data) => {
                    let c = data.as_single().ok_or_else(|| {
                        NodeError::Configuration("expected a single chat memory".to_string())
                    })?;
                    Some(handle::<SharedMemory>(c)?)
                }
                None => None,
            },
            None => None,
        };

        let tools = ctx
            .capabilities_of(ConnectionType::Tool)
            .await?
            .iter()
            .map(handle::<SharedTool>)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Equipment { model, memory, tools })
    }

    fn prompt(ctx: &NodeContext, index: usize, item: &Item) -> Option<String> {
        if let Some(prompt) = ctx.get_parameter("prompt", index, Value::Null).as_str() {
            return Some(prompt.to_string());
        }
        match &item.json {
            Value::String(s) => Some(s.clone()),
            json => ["prompt", "text", "chatInput"]
                .iter()
                .find_map(|key| json.get(key).and_then(|v| v.as_str().map(str::to_string))),
        }
    }

    async fn answer(equipment: &Equipment, prompt: &str) -> Result<(String, Option<String>), NodeError> {
        if let Some(command) = prompt.strip_prefix('/') {
            let (name, input) = command.split_once(' ').unwrap_or((command, ""));
            let tool = equipment
                .tools
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| NodeError::ExecutionFailed(format!("Unknown tool: {}", name)))?;
            let output = tool.call(input.trim()).await?;
            return Ok((output, Some(name.to_string())));
        }

        let mut conversation = match &equipment.memory {
            Some(memory) => memory.messages().await,
            None => Vec::new(),
        };
        conversation.push(ChatMessage::user(prompt));
        let output = equipment.model.generate(&conversation).await?;
        Ok((output, None))
    }
}

#[async_trait]
impl ExecutableNode for AgentNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let equipment = Self::equip(ctx).await?;
        tracing::debug!(
            node_id = %ctx.node_id(),
            model = equipment.model.model_name(),
            tools = equipment.tools.len(),
            memory = equipment.memory.is_some(),
            "Agent equipped"
        );

        let mut collector = ctx.collector();
        for (index, item) in input.into_items(0).iter().enumerate() {
            let Some(prompt) = Self::prompt(ctx, index, item) else {
                collector.fail(index, NodeError::MissingInput("prompt".to_string()))?;
                continue;
            };

            match Self::answer(&equipment, &prompt).await {
                Ok((output, tool)) => {
                    if let Some(memory) = &equipment.memory {
                        memory.append(ChatMessage::user(prompt.as_str())).await;
                        memory.append(ChatMessage::assistant(output.as_str())).await;
                    }
                    let mut fields = HashMap::new();
                    fields.insert("output".to_string(), Value::String(output));
                    if let Some(tool) = tool {
                        fields.insert("tool".to_string(), Value::String(tool));
                    }
                    collector.push(0, Item::new(fields).paired(index));
                }
                Err(e) => collector.fail(index, e)?,
            }
        }

        Ok(collector.finish())
    }
}
