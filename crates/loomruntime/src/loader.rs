use loomcore::{FlowError, Workflow, WorkflowError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Reads workflow definitions from JSON files.
pub struct WorkflowLoader {
    dir: PathBuf,
}

impl WorkflowLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Parse one workflow file.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Workflow, FlowError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let workflow = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), workflow_id = %workflow.id, "Loaded workflow");
        Ok(workflow)
    }

    /// Parse a workflow from JSON text, checking only that identifiers are well formed.
    pub fn parse(json: &str) -> Result<Workflow, FlowError> {
        let workflow: Workflow = serde_json::from_str(json)?;

        let mut seen = HashSet::new();
        for node in &workflow.nodes {
            if !seen.insert(node.id) {
                return Err(WorkflowError::Invalid(format!("duplicate node id {}", node.id)).into());
            }
        }
        for connection in &workflow.connections {
            for endpoint in [connection.source_node, connection.target_node] {
                if !seen.contains(&endpoint) {
                    return Err(WorkflowError::NodeNotFound(endpoint.to_string()).into());
                }
            }
        }
        Ok(workflow)
    }

    /// Load every `*.json` file in the loader's directory, sorted by file name.
    pub async fn load_all(&self) -> Result<Vec<Workflow>, FlowError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut workflows = Vec::with_capacity(paths.len());
        for path in paths {
            workflows.push(Self::load_file(&path).await?);
        }
        Ok(workflows)
    }
}
