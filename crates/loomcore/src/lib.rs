//! Core abstractions for the loom automation runtime
//!
//! This crate provides the data model and the contracts between the runtime
//! and node implementations: connection types and ports, versioned node type
//! descriptors, the `execute`/`trigger`/`supply_data` hooks and the contexts
//! they receive. It performs no scheduling itself.

mod capability;
mod connection;
mod descriptor;
mod error;
pub mod events;
mod node;
mod port;
mod run;
mod trigger;
mod value;
mod version;
mod workflow;

pub use capability::{Capability, CloseFn, SuppliedData, SupplyResponse};
pub use connection::{
    ConnectionKind, ConnectionType, ConnectionTypeInfo, ConnectionTypeRegistry, DataFlow,
    MaxConnections,
};
pub use descriptor::{
    NodeBehavior, NodeRole, NodeTypeDescription, NodeTypeDescriptor, ParameterKind,
    ParameterSpec, VersionLifecycle,
};
pub use error::{
    CapabilityError, FlowError, GraphError, NodeError, NodeFailure, RegistryError, TriggerError,
    WorkflowError,
};
pub use events::*;
pub use node::{
    CapabilityProvider, ExecutableNode, NoCapabilities, NodeContext, NodeInput, NodeMetadata,
    NodeOutput, OutputCollector, ParameterResolver, StaticParameters, SupplyDataNode,
};
pub use port::{PortDirection, PortRef, PortSpec};
pub use run::{ExecutionMode, NodeOutcome, NodeRunRecord, RunStatus};
pub use trigger::{
    ActivationMode, EmitSink, ManualFn, ScheduledCallback, ScheduledFn, TeardownFn,
    TriggerContext, TriggerEmitter, TriggerNode, TriggerResponse,
};
pub use value::{Item, ItemError, Value};
pub use version::{NodeVersion, VersionRequest};
pub use workflow::{
    Connection, NodeId, NodeInstance, Position, RetryPolicy, Workflow, WorkflowId,
    WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
