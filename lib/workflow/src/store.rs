//! Workflow and run persistence.
//!
//! Workflows are read-only templates; runs are checkpointed after every
//! state change. Both come with an in-memory store for tests and embedding
//! and a directory-backed store for the CLI.

use crate::definition::WorkflowDefinition;
use crate::envelope::{self, EnvelopeError};
use crate::run_state::RunState;
use async_trait::async_trait;
use flowrun_core::{WorkflowId, WorkflowRunId};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Nothing is stored under the key.
    NotFound { key: String },
    /// The backing storage failed.
    Io { reason: String },
    /// A stored record could not be decoded.
    Corrupted { key: String, reason: String },
    /// A stored record was written by an incompatible version.
    UnsupportedVersion { key: String, version: u32 },
}

impl StoreError {
    fn io(err: &std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }

    fn from_envelope(key: &str, err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Malformed { reason } => Self::Corrupted {
                key: key.to_string(),
                reason,
            },
            EnvelopeError::UnsupportedVersion { version } => Self::UnsupportedVersion {
                key: key.to_string(),
                version,
            },
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "not found: {key}"),
            Self::Io { reason } => write!(f, "storage error: {reason}"),
            Self::Corrupted { key, reason } => write!(f, "record {key} is corrupted: {reason}"),
            Self::UnsupportedVersion { key, version } => {
                write!(f, "record {key} has unsupported version {version}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Source of workflow templates.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Loads a workflow by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    async fn load_workflow(&self, id: &WorkflowId) -> Result<WorkflowDefinition, StoreError>;

    /// Lists the stored workflow ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    async fn list_workflows(&self) -> Result<Vec<WorkflowId>, StoreError>;
}

/// Durable record of run checkpoints.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Writes the latest checkpoint of a run, replacing the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    async fn save_checkpoint(&self, state: &RunState) -> Result<(), StoreError>;

    /// Loads the latest checkpoint of a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown runs.
    async fn load_checkpoint(&self, run_id: &WorkflowRunId) -> Result<RunState, StoreError>;

    /// Lists the runs with checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    async fn list_runs(&self) -> Result<Vec<WorkflowRunId>, StoreError>;
}

/// Workflow store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a workflow.
    pub async fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow);
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn load_workflow(&self, id: &WorkflowId) -> Result<WorkflowDefinition, StoreError> {
        self.workflows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: id.to_string() })
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let mut ids: Vec<_> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Workflow store reading `<id>.json` template files from a directory.
#[derive(Debug, Clone)]
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    /// Creates a store over `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn load_workflow(&self, id: &WorkflowId) -> Result<WorkflowDefinition, StoreError> {
        let bytes = read_optional(&self.path_for(id))
            .await?
            .ok_or_else(|| StoreError::NotFound { key: id.to_string() })?;
        WorkflowDefinition::from_json_slice(&bytes).map_err(|e| StoreError::Corrupted {
            key: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowId>, StoreError> {
        Ok(list_json_stems(&self.dir)
            .await?
            .into_iter()
            .map(WorkflowId::from)
            .collect())
    }
}

/// Run store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<WorkflowRunId, RunState>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_checkpoint(&self, state: &RunState) -> Result<(), StoreError> {
        self.runs.write().await.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &WorkflowRunId) -> Result<RunState, StoreError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: run_id.to_string(),
            })
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRunId>, StoreError> {
        let mut ids: Vec<_> = self.runs.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Run store writing one enveloped `<run-id>.json` file per run.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Creates a store over `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, run_id: &WorkflowRunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save_checkpoint(&self, state: &RunState) -> Result<(), StoreError> {
        let key = state.run_id.to_string();
        let bytes = envelope::seal(state).map_err(|e| StoreError::from_envelope(&key, e))?;
        write_atomic(&self.path_for(&state.run_id), &bytes).await
    }

    async fn load_checkpoint(&self, run_id: &WorkflowRunId) -> Result<RunState, StoreError> {
        let key = run_id.to_string();
        let bytes = read_optional(&self.path_for(run_id))
            .await?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        envelope::open(&bytes).map_err(|e| StoreError::from_envelope(&key, e))
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRunId>, StoreError> {
        let mut ids: Vec<WorkflowRunId> = list_json_stems(&self.dir)
            .await?
            .iter()
            .filter_map(|stem| stem.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Reads a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(&e)),
    }
}

/// Writes through a temporary file and a rename so readers never see a
/// partial record.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(&e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(&e))
}

/// Lists the stems of the `*.json` files in a directory, sorted.
pub(crate) async fn list_json_stems(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(&e)),
    };
    let mut stems = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(&e))? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::handler::{HandlerRegistry, NodeContext, NodeHandler, NodeOutcome, NodeOutput};
    use crate::error::NodeError;
    use crate::node::{Node, NodeKind};
    use crate::validate::ExecutionPlan;
    use serde_json::{Value as JsonValue, json};
    use std::sync::Arc;

    struct Noop(NodeKind);

    #[async_trait]
    impl NodeHandler for Noop {
        fn kind(&self) -> NodeKind {
            self.0.clone()
        }

        async fn execute(&self, _ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
            Ok(NodeOutcome::Completed(NodeOutput::pure(JsonValue::Null)))
        }
    }

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("greet", "Greeter")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge(Edge::new("e1", "start", "end"))
    }

    fn plan() -> ExecutionPlan {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Noop(NodeKind::Start)))
            .with(Arc::new(Noop(NodeKind::End)));
        crate::validate::plan(&workflow(), &registry).expect("valid")
    }

    #[tokio::test]
    async fn in_memory_workflow_store() {
        let store = InMemoryWorkflowStore::new();
        store.insert(workflow()).await;

        let loaded = store.load_workflow(&"greet".into()).await.expect("load");
        assert_eq!(loaded.name, "Greeter");
        assert_eq!(
            store.list_workflows().await.expect("list"),
            vec![WorkflowId::from("greet")]
        );
        assert!(matches!(
            store.load_workflow(&"nope".into()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn file_workflow_store_reads_templates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bytes = serde_json::to_vec(&workflow()).expect("serialize");
        std::fs::write(dir.path().join("greet.json"), bytes).expect("write");
        std::fs::write(dir.path().join("broken.json"), b"{").expect("write");

        let store = FileWorkflowStore::new(dir.path());
        assert_eq!(
            store.load_workflow(&"greet".into()).await.expect("load"),
            workflow()
        );
        assert!(matches!(
            store.load_workflow(&"broken".into()).await,
            Err(StoreError::Corrupted { .. })
        ));
        assert_eq!(store.list_workflows().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn file_run_store_checkpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(dir.path().join("runs")).expect("store");
        let mut state = RunState::new(WorkflowRunId::new(), "greet".into(), json!({"name": "Ada"}), &plan());

        store.save_checkpoint(&state).await.expect("save");
        state.start();
        store.save_checkpoint(&state).await.expect("overwrite");

        let loaded = store.load_checkpoint(&state.run_id).await.expect("load");
        assert_eq!(loaded.status, state.status);
        assert_eq!(loaded.variables["input"], json!({"name": "Ada"}));
        assert_eq!(store.list_runs().await.expect("list"), vec![state.run_id]);

        assert!(matches!(
            store.load_checkpoint(&WorkflowRunId::new()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn file_run_store_refuses_unknown_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileRunStore::new(dir.path()).expect("store");
        let run_id = WorkflowRunId::new();
        std::fs::write(
            dir.path().join(format!("{run_id}.json")),
            br#"{"version": 99, "payload": {}}"#,
        )
        .expect("write");

        assert_eq!(
            store.load_checkpoint(&run_id).await.unwrap_err(),
            StoreError::UnsupportedVersion {
                key: run_id.to_string(),
                version: 99
            }
        );
    }
}
