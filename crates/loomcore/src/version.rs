use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Node type version number such as `1`, `1.1` or `2`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeVersion(f64);

impl NodeVersion {
    pub fn new(version: f64) -> Self {
        Self(version)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for NodeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NodeVersion {}

impl PartialOrd for NodeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for NodeVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<f64> for NodeVersion {
    fn from(version: f64) -> Self {
        Self(version)
    }
}

impl From<u32> for NodeVersion {
    fn from(version: u32) -> Self {
        Self(f64::from(version))
    }
}

/// The version(s) a node instance was authored against.
///
/// Serialized as absent/`null` (latest), a single number, or an array of numbers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionRequest {
    #[default]
    Latest,
    Exact(NodeVersion),
    AnyOf(Vec<NodeVersion>),
}

impl VersionRequest {
    pub fn exact(version: impl Into<NodeVersion>) -> Self {
        VersionRequest::Exact(version.into())
    }

    pub fn any_of<V: Into<NodeVersion>>(versions: impl IntoIterator<Item = V>) -> Self {
        VersionRequest::AnyOf(versions.into_iter().map(Into::into).collect())
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, VersionRequest::Latest)
    }

    /// Whether `version` is acceptable for this request.
    pub fn accepts(&self, version: NodeVersion) -> bool {
        match self {
            VersionRequest::Latest => true,
            VersionRequest::Exact(v) => *v == version,
            VersionRequest::AnyOf(vs) => vs.contains(&version),
        }
    }
}

impl fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRequest::Latest => f.write_str("latest"),
            VersionRequest::Exact(v) => write!(f, "{}", v),
            VersionRequest::AnyOf(vs) => {
                let parts: Vec<String> = vs.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}
