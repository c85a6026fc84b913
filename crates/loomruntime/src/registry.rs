use loomcore::{
    NodeTypeDescription, NodeTypeDescriptor, NodeVersion, RegistryError, VersionLifecycle,
    VersionRequest,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Every registered version of one node type.
#[derive(Debug, Clone)]
pub enum NodeVersions {
    /// Type known in a single version; any request resolves to it.
    Single(Arc<NodeTypeDescriptor>),
    Versioned(BTreeMap<NodeVersion, Arc<NodeTypeDescriptor>>),
}

impl NodeVersions {
    pub fn versions(&self) -> Vec<NodeVersion> {
        match self {
            NodeVersions::Single(d) => vec![d.version()],
            NodeVersions::Versioned(map) => map.keys().copied().collect(),
        }
    }

    pub fn latest(&self) -> Option<&Arc<NodeTypeDescriptor>> {
        match self {
            NodeVersions::Single(d) => Some(d),
            NodeVersions::Versioned(map) => map.values().next_back(),
        }
    }

    /// Newest version that is not hidden, if any.
    pub fn offered(&self) -> Option<&Arc<NodeTypeDescriptor>> {
        match self {
            NodeVersions::Single(d) => {
                (d.description.lifecycle != VersionLifecycle::Hidden).then_some(d)
            }
            NodeVersions::Versioned(map) => map
                .values()
                .rev()
                .find(|d| d.description.lifecycle != VersionLifecycle::Hidden),
        }
    }

    fn insert(&mut self, descriptor: Arc<NodeTypeDescriptor>) -> Result<(), RegistryError> {
        let version = descriptor.version();
        match self {
            NodeVersions::Single(existing) => {
                if existing.version() == version {
                    return Err(RegistryError::DuplicateVersion {
                        name: descriptor.name().to_string(),
                        version,
                    });
                }
                let mut map = BTreeMap::new();
                map.insert(existing.version(), Arc::clone(existing));
                map.insert(version, descriptor);
                *self = NodeVersions::Versioned(map);
            }
            NodeVersions::Versioned(map) => {
                if map.contains_key(&version) {
                    return Err(RegistryError::DuplicateVersion {
                        name: descriptor.name().to_string(),
                        version,
                    });
                }
                map.insert(version, descriptor);
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str, requested: &VersionRequest) -> Result<&Arc<NodeTypeDescriptor>, RegistryError> {
        let map = match self {
            NodeVersions::Single(d) => return Ok(d),
            NodeVersions::Versioned(map) => map,
        };

        let found = match requested {
            VersionRequest::Latest => map.values().next_back(),
            VersionRequest::Exact(v) => map.get(v),
            VersionRequest::AnyOf(candidates) => candidates
                .iter()
                .filter_map(|v| map.get_key_value(v))
                .max_by_key(|(v, _)| **v)
                .map(|(_, d)| d),
        };

        found.ok_or_else(|| RegistryError::UnsupportedNodeVersion {
            name: name.to_string(),
            requested: requested.to_string(),
            available: map.keys().copied().collect(),
        })
    }
}

/// Registry of available node types, keyed by name and version
#[derive(Debug, Default)]
pub struct NodeTypeRegistry {
    types: HashMap<String, NodeVersions>,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register one version of a node type
    pub fn register(&mut self, descriptor: NodeTypeDescriptor) -> Result<(), RegistryError> {
        descriptor
            .validate()
            .map_err(|reason| RegistryError::InvalidDescriptor {
                name: descriptor.name().to_string(),
                reason,
            })?;

        let name = descriptor.name().to_string();
        let version = descriptor.version();
        let descriptor = Arc::new(descriptor);

        match self.types.get_mut(&name) {
            Some(versions) => versions.insert(descriptor)?,
            None => {
                self.types
                    .insert(name.clone(), NodeVersions::Single(descriptor));
            }
        }

        tracing::info!("Registering node type: {} v{}", name, version);
        Ok(())
    }

    /// Resolve a node instance's requested version to one implementation.
    ///
    /// Types registered in a single version answer every request with it.
    /// Otherwise the highest registered version among the requested ones wins.
    pub fn resolve(
        &self,
        name: &str,
        requested: &VersionRequest,
    ) -> Result<Arc<NodeTypeDescriptor>, RegistryError> {
        let versions = self
            .types
            .get(name)
            .ok_or_else(|| RegistryError::UnknownNodeType(name.to_string()))?;
        versions.resolve(name, requested).map(Arc::clone)
    }

    pub fn versions(&self, name: &str) -> Option<&NodeVersions> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Get all registered node type names, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptions offered for new nodes: the newest non-hidden version of each type.
    pub fn catalog(&self) -> Vec<NodeTypeDescription> {
        let mut catalog: Vec<NodeTypeDescription> = self
            .types
            .values()
            .filter_map(NodeVersions::offered)
            .map(|d| d.description.clone())
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }
}
