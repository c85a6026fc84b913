//! Workflow execution runtime
//!
//! This crate resolves node versions, builds and validates connection graphs,
//! runs workflows along their item-stream order, constructs capabilities on
//! demand and manages the lifecycle of trigger nodes.

mod capability;
mod executor;
pub mod graph;
mod loader;
mod registry;
mod runtime;
mod trigger;

pub use capability::{CapabilityCache, CapabilityResolver};
pub use executor::{ExecutionResult, RunError, RunStart, WorkflowExecutor};
pub use graph::{ConnectionGraph, Edge, ResolvedNode};
pub use loader::WorkflowLoader;
pub use registry::{NodeTypeRegistry, NodeVersions};
pub use runtime::{LoomRuntime, RuntimeConfig, DEFAULT_CAPABILITY_DEPTH};
pub use trigger::{RunSpawner, TriggerManager, TriggerState};
