use async_trait::async_trait;
use loomcore::{
    ExecutableNode, NodeContext, NodeError, NodeFailure, NodeInput, NodeOutput,
    NodeTypeDescription, NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec,
};
use tokio::time::{sleep, Duration};

/// Delay the item stream for a specified duration
pub struct DelayNode;

#[async_trait]
impl ExecutableNode for DelayNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let delay_ms = ctx
            .get_parameter("delay_ms", 0, 1000i64)
            .as_f64()
            .unwrap_or(1000.0)
            .max(0.0) as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled.into()),
        }

        Ok(NodeOutput::from_items(input.into_items(0)))
    }
}

pub fn descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("time.delay", 1u32)
            .with_display_name("Delay")
            .with_description("Delay execution for specified milliseconds")
            .with_category("time")
            .with_input(PortSpec::main("Input"))
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("delay_ms", ParameterKind::Number).with_default(1000i64)),
        DelayNode,
    )
}
