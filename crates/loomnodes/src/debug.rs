use async_trait::async_trait;
use loomcore::{
    ExecutableNode, NodeContext, NodeFailure, NodeInput, NodeOutput, NodeTypeDescription,
    NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec,
};

/// Logs every item it receives and passes them through unchanged
pub struct DebugNode;

#[async_trait]
impl ExecutableNode for DebugNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let items = input.into_items(0);
        let prefix = ctx.get_parameter("prefix", 0, "DEBUG");
        let prefix = prefix.as_str().unwrap_or("DEBUG");

        ctx.events.info(format!("{}: {} item(s)", prefix, items.len()));
        for (index, item) in items.iter().enumerate() {
            ctx.events.info(format!("  [{}] {}", index, item.json.to_plain_json()));
        }

        Ok(NodeOutput::from_items(items))
    }
}

pub fn descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("debug.log", 1u32)
            .with_display_name("Debug")
            .with_description("Logs input items for debugging")
            .with_category("debug")
            .with_input(PortSpec::main("Input"))
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("prefix", ParameterKind::String).with_default("DEBUG")),
        DebugNode,
    )
}
