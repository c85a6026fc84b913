use async_trait::async_trait;
use loomcore::{
    ExecutableNode, Item, NodeContext, NodeError, NodeFailure, NodeInput, NodeOutput,
    NodeTypeDescription, NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec, Value,
};
use std::collections::HashMap;

/// Parse a JSON string field of each item into structured data
pub struct JsonParseNode;

#[async_trait]
impl ExecutableNode for JsonParseNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let mut collector = ctx.collector();

        for (index, item) in input.into_items(0).into_iter().enumerate() {
            let field = ctx.get_parameter("field", index, "json");
            let field = field.as_str().unwrap_or("json");

            let source = match &item.json {
                Value::String(s) => Some(s.clone()),
                other => other.get(field).and_then(|v| v.as_str().map(str::to_string)),
            };
            let Some(source) = source else {
                collector.fail(
                    index,
                    NodeError::InvalidInputType {
                        field: field.to_string(),
                        expected: "string".to_string(),
                        actual: "other".to_string(),
                    },
                )?;
                continue;
            };

            match serde_json::from_str::<serde_json::Value>(&source) {
                Ok(parsed) => collector.push(0, Item::new(Value::from_plain_json(parsed)).paired(index)),
                Err(e) => collector.fail(
                    index,
                    NodeError::ExecutionFailed(format!("JSON parse error: {}", e)),
                )?,
            }
        }

        Ok(collector.finish())
    }
}

/// Serialize each item into a JSON string
pub struct JsonStringifyNode;

#[async_trait]
impl ExecutableNode for JsonStringifyNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let mut collector = ctx.collector();

        for (index, item) in input.into_items(0).into_iter().enumerate() {
            let pretty = ctx.get_parameter("pretty", index, false).as_bool().unwrap_or(false);
            let plain = item.json.to_plain_json();
            let rendered = if pretty {
                serde_json::to_string_pretty(&plain)
            } else {
                serde_json::to_string(&plain)
            };

            match rendered {
                Ok(json) => {
                    let mut fields = HashMap::new();
                    fields.insert("json".to_string(), Value::String(json));
                    collector.push(0, Item::new(fields).paired(index));
                }
                Err(e) => collector.fail(
                    index,
                    NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)),
                )?,
            }
        }

        Ok(collector.finish())
    }
}

pub fn json_parse_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("transform.json_parse", 1u32)
            .with_display_name("Parse JSON")
            .with_description("Parse JSON string")
            .with_category("transform")
            .with_input(PortSpec::main("Input"))
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("field", ParameterKind::String).with_default("json")),
        JsonParseNode,
    )
}

pub fn json_stringify_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("transform.json_stringify", 1u32)
            .with_display_name("Stringify JSON")
            .with_description("Convert each item to a JSON string")
            .with_category("transform")
            .with_input(PortSpec::main("Input"))
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("pretty", ParameterKind::Boolean).with_default(false)),
        JsonStringifyNode,
    )
}
