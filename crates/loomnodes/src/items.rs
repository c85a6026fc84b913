use async_trait::async_trait;
use loomcore::{
    ExecutableNode, Item, NodeContext, NodeFailure, NodeInput, NodeOutput, NodeTypeDescription,
    NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec, Value,
};
use std::collections::HashMap;

/// Split a parameter value into items: arrays yield one item per element,
/// anything else a single item. A missing value yields one empty object.
pub fn items_from_value(value: Value) -> Vec<Item> {
    match value {
        Value::Null => vec![Item::new(Value::Object(HashMap::new()))],
        Value::Array(values) => values.into_iter().map(Item::new).collect(),
        Value::Json(serde_json::Value::Array(values)) => values
            .into_iter()
            .map(|v| Item::new(Value::from_plain_json(v)))
            .collect(),
        Value::Json(other) => vec![Item::new(Value::from_plain_json(other))],
        other => vec![Item::new(other)],
    }
}

/// Source node emitting the items configured on it
pub struct ItemsNode;

#[async_trait]
impl ExecutableNode for ItemsNode {
    async fn execute(&self, ctx: &NodeContext, _input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let items = items_from_value(ctx.get_parameter("items", 0, Value::Null));
        ctx.events.info(format!("Emitting {} item(s)", items.len()));
        Ok(NodeOutput::from_items(items))
    }
}

pub fn descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("core.items", 1u32)
            .with_display_name("Items")
            .with_description("Emit a fixed list of items")
            .with_category("core")
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("items", ParameterKind::Json)),
        ItemsNode,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arrays_become_one_item_per_element() {
        let items = items_from_value(Value::Json(json!([{"a": 1}, {"a": 2}])));
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].json.get("a"), Some(Value::Number(2.0)));

        let items = items_from_value(Value::Array(vec![Value::Number(1.0), Value::Bool(true)]));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn missing_value_yields_single_empty_item() {
        let items = items_from_value(Value::Null);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].json, Value::Object(HashMap::new()));
    }
}
