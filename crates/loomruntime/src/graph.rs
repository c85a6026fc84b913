//! Validated wiring of one workflow.
//!
//! The graph is built once when a workflow is loaded and rebuilt wholesale on
//! structural edits. It is read-only afterwards and shared by every run of
//! the workflow.

use crate::registry::NodeTypeRegistry;
use loomcore::{
    Connection, ConnectionKind, ConnectionType, ConnectionTypeRegistry, GraphError, NodeBehavior,
    NodeId, NodeInstance, NodeRole, NodeTypeDescription, NodeTypeDescriptor, PortRef, PortSpec,
    Workflow, WorkflowId, WorkflowSettings,
};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use petgraph::Direction;

/// A node instance together with the implementation its version resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub instance: Arc<NodeInstance>,
    pub descriptor: Arc<NodeTypeDescriptor>,
    pub description: Arc<NodeTypeDescription>,
}

impl ResolvedNode {
    pub fn id(&self) -> NodeId {
        self.instance.id
    }

    pub fn role(&self) -> NodeRole {
        self.descriptor.role()
    }

    pub fn behavior(&self) -> &NodeBehavior {
        &self.descriptor.behavior
    }

    pub fn input(&self, index: usize) -> Option<&PortSpec> {
        self.description.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&PortSpec> {
        self.description.outputs.get(index)
    }
}

/// A validated connection between an output port and an input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: PortRef,
    pub target: PortRef,
    /// Copied from the bound ports; always equal on both ends.
    pub connection_type: ConnectionType,
    /// Position in the workflow's connection list.
    pub ordinal: usize,
}

#[derive(Debug)]
pub struct ConnectionGraph {
    workflow_id: WorkflowId,
    settings: WorkflowSettings,
    nodes: HashMap<NodeId, ResolvedNode>,
    declaration_order: Vec<NodeId>,
    edges: Vec<Edge>,
    incoming: HashMap<PortRef, Vec<usize>>,
    outgoing: HashMap<PortRef, Vec<usize>>,
    by_node: HashMap<NodeId, (Vec<usize>, Vec<usize>)>,
    item_graph: DiGraph<NodeId, usize>,
    item_index: HashMap<NodeId, NodeIndex>,
}

impl ConnectionGraph {
    /// Build and validate the graph of a workflow
    pub fn from_workflow(
        workflow: &Workflow,
        registry: &NodeTypeRegistry,
        connection_types: &ConnectionTypeRegistry,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::build(
            &workflow.nodes,
            &workflow.connections,
            registry,
            connection_types,
        )?;
        graph.workflow_id = workflow.id;
        graph.settings = workflow.settings.clone();
        Ok(graph)
    }

    /// Same as `from_workflow` without the cardinality, required-input and
    /// acyclicity checks, to reach resolver states validation rules out.
    #[cfg(test)]
    pub(crate) fn from_workflow_unchecked(
        workflow: &Workflow,
        registry: &NodeTypeRegistry,
        connection_types: &ConnectionTypeRegistry,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::bind(
            &workflow.nodes,
            &workflow.connections,
            registry,
            connection_types,
        )?;
        graph.workflow_id = workflow.id;
        graph.settings = workflow.settings.clone();
        Ok(graph)
    }

    /// Resolve every node, bind every connection to its ports and validate the result.
    pub fn build(
        nodes: &[NodeInstance],
        connections: &[Connection],
        registry: &NodeTypeRegistry,
        connection_types: &ConnectionTypeRegistry,
    ) -> Result<Self, GraphError> {
        let graph = Self::bind(nodes, connections, registry, connection_types)?;

        graph.check_cardinality()?;
        graph.check_required_inputs()?;
        graph.check_acyclic()?;

        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Connection graph built"
        );
        Ok(graph)
    }

    fn bind(
        nodes: &[NodeInstance],
        connections: &[Connection],
        registry: &NodeTypeRegistry,
        connection_types: &ConnectionTypeRegistry,
    ) -> Result<Self, GraphError> {
        let mut graph = ConnectionGraph {
            workflow_id: WorkflowId::nil(),
            settings: WorkflowSettings::default(),
            nodes: HashMap::with_capacity(nodes.len()),
            declaration_order: Vec::with_capacity(nodes.len()),
            edges: Vec::with_capacity(connections.len()),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            by_node: HashMap::new(),
            item_graph: DiGraph::new(),
            item_index: HashMap::new(),
        };

        for instance in nodes {
            graph.add_node(instance, registry, connection_types)?;
        }
        for (ordinal, connection) in connections.iter().enumerate() {
            graph.add_edge(ordinal, connection)?;
        }
        Ok(graph)
    }

    fn add_node(
        &mut self,
        instance: &NodeInstance,
        registry: &NodeTypeRegistry,
        connection_types: &ConnectionTypeRegistry,
    ) -> Result<(), GraphError> {
        if self.nodes.contains_key(&instance.id) {
            return Err(GraphError::DuplicateNode(instance.id));
        }

        let descriptor = registry.resolve(&instance.type_name, &instance.type_version)?;
        for port in descriptor
            .description
            .inputs
            .iter()
            .chain(&descriptor.description.outputs)
        {
            connection_types.describe(port.connection_type)?;
        }

        let index = self.item_graph.add_node(instance.id);
        self.item_index.insert(instance.id, index);
        self.declaration_order.push(instance.id);
        self.by_node.insert(instance.id, (Vec::new(), Vec::new()));
        self.nodes.insert(
            instance.id,
            ResolvedNode {
                instance: Arc::new(instance.clone()),
                description: Arc::new(descriptor.description.clone()),
                descriptor,
            },
        );
        Ok(())
    }

    fn add_edge(&mut self, ordinal: usize, connection: &Connection) -> Result<(), GraphError> {
        let source = self
            .nodes
            .get(&connection.source_node)
            .ok_or(GraphError::NodeNotFound(connection.source_node))?;
        let target = self
            .nodes
            .get(&connection.target_node)
            .ok_or(GraphError::NodeNotFound(connection.target_node))?;

        let source_port = source
            .output(connection.source_output)
            .ok_or(GraphError::PortNotFound {
                node_id: connection.source_node,
                direction: "output",
                index: connection.source_output,
            })?;
        let target_port = target
            .input(connection.target_input)
            .ok_or(GraphError::PortNotFound {
                node_id: connection.target_node,
                direction: "input",
                index: connection.target_input,
            })?;

        if source_port.connection_type != target_port.connection_type {
            return Err(GraphError::TypeMismatch {
                source_node: connection.source_node,
                source_output: connection.source_output,
                target_node: connection.target_node,
                target_input: connection.target_input,
                source_type: source_port.connection_type,
                target_type: target_port.connection_type,
            });
        }

        let edge = Edge {
            source: PortRef::new(connection.source_node, connection.source_output),
            target: PortRef::new(connection.target_node, connection.target_input),
            connection_type: target_port.connection_type,
            ordinal,
        };
        let edge_index = self.edges.len();

        if edge.connection_type.is_item_stream() {
            let from = self.item_index[&edge.source.node_id];
            let to = self.item_index[&edge.target.node_id];
            self.item_graph.add_edge(from, to, edge_index);
        }

        self.incoming.entry(edge.target).or_default().push(edge_index);
        self.outgoing.entry(edge.source).or_default().push(edge_index);
        if let Some((_, outs)) = self.by_node.get_mut(&edge.source.node_id) {
            outs.push(edge_index);
        }
        if let Some((ins, _)) = self.by_node.get_mut(&edge.target.node_id) {
            ins.push(edge_index);
        }
        self.edges.push(edge);
        Ok(())
    }

    fn check_cardinality(&self) -> Result<(), GraphError> {
        for node_id in &self.declaration_order {
            let node = &self.nodes[node_id];
            for (index, port) in node.description.inputs.iter().enumerate() {
                let bound = self.bound_count(PortRef::new(*node_id, index));
                if !port.max_connections.allows(bound) {
                    return Err(GraphError::CardinalityExceeded {
                        node_id: *node_id,
                        input: index,
                        max: port.max_connections.limit().unwrap_or(usize::MAX),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_required_inputs(&self) -> Result<(), GraphError> {
        for node_id in &self.declaration_order {
            let node = &self.nodes[node_id];
            if node.instance.disabled {
                continue;
            }

            let mut declares_items = false;
            let mut has_item_edge = false;
            for (index, port) in node.description.inputs.iter().enumerate() {
                let port_ref = PortRef::new(*node_id, index);
                let kind = port.connection_type.standard_info().kind;
                match kind {
                    ConnectionKind::ItemStream => {
                        declares_items = true;
                        has_item_edge |= self.bound_count(port_ref) > 0;
                    }
                    ConnectionKind::Capability => {
                        if port.required && self.enabled_suppliers(port_ref).is_empty() {
                            return Err(GraphError::MissingRequiredCapability {
                                node_id: *node_id,
                                input: index,
                                connection_type: port.connection_type,
                            });
                        }
                    }
                }
            }

            if node.role() == NodeRole::Execute && declares_items && !has_item_edge {
                return Err(GraphError::NoItemInput(*node_id));
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        if toposort(&self.item_graph, None).is_ok() {
            return Ok(());
        }

        for component in tarjan_scc(&self.item_graph) {
            let is_cycle = component.len() > 1
                || self
                    .item_graph
                    .find_edge(component[0], component[0])
                    .is_some();
            if is_cycle {
                let members: HashSet<NodeId> =
                    component.iter().map(|idx| self.item_graph[*idx]).collect();
                let nodes = self
                    .declaration_order
                    .iter()
                    .filter(|id| members.contains(id))
                    .copied()
                    .collect();
                return Err(GraphError::Cyclic { nodes });
            }
        }
        Err(GraphError::Cyclic { nodes: Vec::new() })
    }

    fn bound_count(&self, port: PortRef) -> usize {
        self.incoming.get(&port).map(Vec::len).unwrap_or(0)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn node(&self, node_id: NodeId) -> Option<&ResolvedNode> {
        self.nodes.get(&node_id)
    }

    /// Nodes in workflow declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.declaration_order.iter().map(move |id| &self.nodes[id])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges touching `node_id` in the given direction, optionally of one type,
    /// in declaration order.
    pub fn neighbors(
        &self,
        node_id: NodeId,
        direction: Direction,
        connection_type: Option<ConnectionType>,
    ) -> Vec<&Edge> {
        let Some((ins, outs)) = self.by_node.get(&node_id) else {
            return Vec::new();
        };
        let indices = match direction {
            Direction::Incoming => ins,
            Direction::Outgoing => outs,
        };
        indices
            .iter()
            .map(|i| &self.edges[*i])
            .filter(|e| connection_type.map_or(true, |t| e.connection_type == t))
            .collect()
    }

    /// Edges bound to one input port, in declaration order.
    pub fn incoming(&self, port: PortRef) -> Vec<&Edge> {
        self.incoming
            .get(&port)
            .map(|indices| indices.iter().map(|i| &self.edges[*i]).collect())
            .unwrap_or_default()
    }

    /// Edges leaving one output port, in declaration order.
    pub fn outgoing(&self, port: PortRef) -> Vec<&Edge> {
        self.outgoing
            .get(&port)
            .map(|indices| indices.iter().map(|i| &self.edges[*i]).collect())
            .unwrap_or_default()
    }

    /// Suppliers bound to a capability input, skipping disabled ones.
    pub fn enabled_suppliers(&self, port: PortRef) -> Vec<&Edge> {
        self.incoming(port)
            .into_iter()
            .filter(|e| {
                self.nodes
                    .get(&e.source.node_id)
                    .is_some_and(|n| !n.instance.disabled)
            })
            .collect()
    }

    pub fn trigger_nodes(&self) -> Vec<&ResolvedNode> {
        self.nodes()
            .filter(|n| n.role() == NodeRole::Trigger)
            .collect()
    }

    /// Nodes that can start a run: triggers and execute nodes without item-stream inputs.
    pub fn start_candidates(&self) -> Vec<&ResolvedNode> {
        self.nodes()
            .filter(|n| match n.role() {
                NodeRole::Trigger => true,
                NodeRole::Execute => !n.description.has_item_stream_inputs(),
                NodeRole::SupplyData => false,
            })
            .collect()
    }

    /// Nodes reachable over item-stream edges from `starts`, in dependency order.
    pub fn item_stream_order(&self, starts: &[NodeId]) -> Result<Vec<NodeId>, GraphError> {
        let mut reachable = HashSet::new();
        for start in starts {
            let index = *self
                .item_index
                .get(start)
                .ok_or(GraphError::NodeNotFound(*start))?;
            let mut bfs = Bfs::new(&self.item_graph, index);
            while let Some(next) = bfs.next(&self.item_graph) {
                reachable.insert(next);
            }
        }

        let sorted = toposort(&self.item_graph, None).map_err(|cycle| GraphError::Cyclic {
            nodes: vec![self.item_graph[cycle.node_id()]],
        })?;
        Ok(sorted
            .into_iter()
            .filter(|idx| reachable.contains(idx))
            .map(|idx| self.item_graph[idx])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loomcore::{
        ExecutableNode, MaxConnections, NodeContext, NodeError, NodeFailure, NodeInput, NodeOutput,
        NodeTypeDescriptor, SupplyDataNode, SupplyResponse,
    };

    struct Pass;

    #[async_trait]
    impl ExecutableNode for Pass {
        async fn execute(&self, _ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
            Ok(NodeOutput::from_items(input.into_items(0)))
        }
    }

    struct Model;

    #[async_trait]
    impl SupplyDataNode for Model {
        async fn supply_data(&self, _ctx: &NodeContext, _output: usize) -> Result<SupplyResponse, NodeError> {
            Ok(SupplyResponse::single("model"))
        }
    }

    fn registry() -> NodeTypeRegistry {
        let mut registry = NodeTypeRegistry::new();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.source", 1u32).with_output(PortSpec::main("Output")),
                Pass,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.pass", 1u32)
                    .with_input(PortSpec::main("Input"))
                    .with_output(PortSpec::main("Output")),
                Pass,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::execute(
                NodeTypeDescription::new("test.agent", 1u32)
                    .with_input(PortSpec::main("Input"))
                    .with_input(PortSpec::new(ConnectionType::LanguageModel, "Model").required())
                    .with_input(
                        PortSpec::new(ConnectionType::Tool, "Tools")
                            .with_max_connections(MaxConnections::Limited(2)),
                    )
                    .with_output(PortSpec::main("Output")),
                Pass,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::supply_data(
                NodeTypeDescription::new("test.model", 1u32)
                    .with_output(PortSpec::new(ConnectionType::LanguageModel, "Model")),
                Model,
            ))
            .unwrap();
        registry
            .register(NodeTypeDescriptor::supply_data(
                NodeTypeDescription::new("test.tool", 1u32)
                    .with_output(PortSpec::new(ConnectionType::Tool, "Tool")),
                Model,
            ))
            .unwrap();
        registry
    }

    fn build(workflow: &Workflow) -> Result<ConnectionGraph, GraphError> {
        ConnectionGraph::from_workflow(workflow, &registry(), &ConnectionTypeRegistry::standard())
    }

    fn agent_workflow() -> (Workflow, NodeId, NodeId, NodeId) {
        let mut wf = Workflow::new("agent");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let agent = wf.add_node(NodeInstance::new("test.agent"));
        let model = wf.add_node(NodeInstance::new("test.model"));
        wf.connect(source, 0, agent, 0);
        wf.connect(model, 0, agent, 1);
        (wf, source, agent, model)
    }

    #[test]
    fn valid_agent_graph_builds() {
        let (wf, source, agent, model) = agent_workflow();
        let graph = build(&wf).unwrap();

        let models = graph.neighbors(agent, Direction::Incoming, Some(ConnectionType::LanguageModel));
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].source.node_id, model);

        let order = graph.item_stream_order(&[source]).unwrap();
        assert_eq!(order, vec![source, agent]);
    }

    #[test]
    fn second_model_is_rejected() {
        let (mut wf, _, agent, _) = agent_workflow();
        let other = wf.add_node(NodeInstance::new("test.model"));
        wf.connect(other, 0, agent, 1);
        assert_eq!(
            build(&wf).unwrap_err(),
            GraphError::CardinalityExceeded {
                node_id: agent,
                input: 1,
                max: 1
            }
        );
    }

    #[test]
    fn port_limit_applies_to_tools() {
        let (mut wf, _, agent, _) = agent_workflow();
        for _ in 0..3 {
            let tool = wf.add_node(NodeInstance::new("test.tool"));
            wf.connect(tool, 0, agent, 2);
        }
        assert!(matches!(
            build(&wf),
            Err(GraphError::CardinalityExceeded { input: 2, max: 2, .. })
        ));
    }

    #[test]
    fn missing_required_model_fails_early() {
        let mut wf = Workflow::new("no model");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let agent = wf.add_node(NodeInstance::new("test.agent"));
        wf.connect(source, 0, agent, 0);
        assert_eq!(
            build(&wf).unwrap_err(),
            GraphError::MissingRequiredCapability {
                node_id: agent,
                input: 1,
                connection_type: ConnectionType::LanguageModel
            }
        );
    }

    #[test]
    fn disabled_supplier_does_not_satisfy_requirement() {
        let (mut wf, _, _, model) = agent_workflow();
        for node in wf.nodes.iter_mut().filter(|n| n.id == model) {
            node.disabled = true;
        }
        assert!(matches!(
            build(&wf),
            Err(GraphError::MissingRequiredCapability { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut wf = Workflow::new("mismatch");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let agent = wf.add_node(NodeInstance::new("test.agent"));
        let model = wf.add_node(NodeInstance::new("test.model"));
        wf.connect(source, 0, agent, 1);
        wf.connect(model, 0, agent, 0);
        assert!(matches!(build(&wf), Err(GraphError::TypeMismatch { .. })));
    }

    #[test]
    fn item_stream_cycle_names_participants() {
        let mut wf = Workflow::new("cycle");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let a = wf.add_node(NodeInstance::new("test.pass"));
        let b = wf.add_node(NodeInstance::new("test.pass"));
        wf.connect(source, 0, a, 0);
        wf.connect(a, 0, b, 0);
        wf.connect(b, 0, a, 0);
        match build(&wf) {
            Err(GraphError::Cyclic { nodes }) => assert_eq!(nodes, vec![a, b]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut wf = Workflow::new("loop");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let a = wf.add_node(NodeInstance::new("test.pass"));
        wf.connect(source, 0, a, 0);
        wf.connect(a, 0, a, 0);
        assert_eq!(build(&wf).unwrap_err(), GraphError::Cyclic { nodes: vec![a] });
    }

    #[test]
    fn unconnected_consumer_is_rejected() {
        let mut wf = Workflow::new("orphan");
        let orphan = wf.add_node(NodeInstance::new("test.pass"));
        assert_eq!(build(&wf).unwrap_err(), GraphError::NoItemInput(orphan));
    }

    #[test]
    fn unknown_endpoints_and_ports() {
        let mut wf = Workflow::new("dangling");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let ghost = NodeId::new_v4();
        wf.connect(source, 0, ghost, 0);
        assert_eq!(build(&wf).unwrap_err(), GraphError::NodeNotFound(ghost));

        let mut wf = Workflow::new("bad port");
        let source = wf.add_node(NodeInstance::new("test.source"));
        let pass = wf.add_node(NodeInstance::new("test.pass"));
        wf.connect(source, 3, pass, 0);
        assert!(matches!(
            build(&wf),
            Err(GraphError::PortNotFound { direction: "output", index: 3, .. })
        ));
    }

    #[test]
    fn unregistered_connection_type_is_fatal() {
        let (wf, _, _, _) = agent_workflow();
        let narrow = ConnectionTypeRegistry::from_types([ConnectionType::Main]);
        let err = ConnectionGraph::from_workflow(&wf, &registry(), &narrow).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Registry(loomcore::RegistryError::UnknownConnectionType(_))
        ));
    }

    #[test]
    fn fan_in_edges_keep_declaration_order() {
        let mut wf = Workflow::new("fan-in");
        let first = wf.add_node(NodeInstance::new("test.source"));
        let second = wf.add_node(NodeInstance::new("test.source"));
        let sink = wf.add_node(NodeInstance::new("test.pass"));
        wf.connect(second, 0, sink, 0);
        wf.connect(first, 0, sink, 0);
        let graph = build(&wf).unwrap();
        let sources: Vec<NodeId> = graph
            .incoming(PortRef::new(sink, 0))
            .iter()
            .map(|e| e.source.node_id)
            .collect();
        assert_eq!(sources, vec![second, first]);
    }
}
