//! Standard node library
//!
//! Collection of built-in nodes covering every node role: item-stream
//! transforms, triggers, capability suppliers and an agent consuming them.

pub mod ai;
mod debug;
mod http;
mod items;
mod time;
mod transform;
mod trigger;

pub use debug::DebugNode;
pub use http::HttpRequestNode;
pub use items::{items_from_value, ItemsNode};
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};
pub use trigger::{IntervalTrigger, ManualTrigger};

use loomcore::{NodeTypeDescriptor, RegistryError};
use loomruntime::NodeTypeRegistry;

/// Descriptors of every built-in node type version
pub fn descriptors() -> Vec<NodeTypeDescriptor> {
    let mut all = vec![
        items::descriptor(),
        debug::descriptor(),
        transform::json_parse_descriptor(),
        transform::json_stringify_descriptor(),
        time::descriptor(),
        http::descriptor(),
        trigger::manual_descriptor(),
        trigger::interval_descriptor(),
        ai::echo_model_descriptor(),
        ai::buffer_memory_descriptor(),
        ai::calculator_descriptor(),
        ai::toolkit_descriptor(),
    ];
    all.extend(ai::agent_descriptors());
    all
}

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeTypeRegistry) -> Result<(), RegistryError> {
    for descriptor in descriptors() {
        registry.register(descriptor)?;
    }
    Ok(())
}
