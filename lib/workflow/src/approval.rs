//! Human approval of proposed actions.
//!
//! A node that wants to act on the outside world can pause with a
//! [`ProposedAction`]. The engine files an approval request, and the run
//! stays suspended until someone resolves it and the run is resumed.

use crate::envelope;
use crate::store::{StoreError, list_json_stems, read_optional, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_core::{ApprovalRequestId, NodeId, WorkflowRunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// What a node intends to do, shown to the approver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// One-line description.
    pub summary: String,
    /// The exact call that will be made.
    pub payload: JsonValue,
}

impl ProposedAction {
    /// Creates a proposed action.
    #[must_use]
    pub fn new(summary: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            summary: summary.into(),
            payload,
        }
    }
}

/// A human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Go ahead.
    Approved,
    /// Do not perform the action.
    Rejected,
}

/// Resolution state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// No decision yet.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
    /// The run was cancelled before anyone decided.
    Withdrawn,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Rejected => Self::Rejected,
        }
    }
}

/// A filed approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id.
    pub id: ApprovalRequestId,
    /// The paused run.
    pub run_id: WorkflowRunId,
    /// The paused node.
    pub node_id: NodeId,
    /// What the node intends to do.
    pub action: ProposedAction,
    /// Current resolution.
    pub status: ApprovalStatus,
    /// When the request was filed.
    pub created_at: DateTime<Utc>,
    /// When the request was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    fn new(run_id: WorkflowRunId, node_id: NodeId, action: ProposedAction) -> Self {
        Self {
            id: ApprovalRequestId::new(),
            run_id,
            node_id,
            action,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    fn settle(&mut self, status: ApprovalStatus) -> Result<(), ApprovalError> {
        if self.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id: self.id,
                status: self.status,
            });
        }
        self.status = status;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// Errors from approval operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// No request with this id.
    NotFound { id: ApprovalRequestId },
    /// The request already has a decision.
    AlreadyResolved {
        id: ApprovalRequestId,
        status: ApprovalStatus,
    },
    /// The backing storage failed.
    Storage(StoreError),
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "approval request not found: {id}"),
            Self::AlreadyResolved { id, status } => {
                write!(f, "approval request {id} is already {status:?}")
            }
            Self::Storage(e) => write!(f, "approval storage error: {e}"),
        }
    }
}

impl std::error::Error for ApprovalError {}

impl From<StoreError> for ApprovalError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

/// Files and resolves approval requests.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Files a request for a paused node.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be stored.
    async fn request_approval(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
        action: &ProposedAction,
    ) -> Result<ApprovalRequestId, ApprovalError>;

    /// Returns the current resolution of a request.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids.
    async fn resolution(&self, id: &ApprovalRequestId) -> Result<ApprovalStatus, ApprovalError>;

    /// Records a decision.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or already resolved requests.
    async fn resolve(
        &self,
        id: &ApprovalRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApprovalError>;

    /// Withdraws a request nobody decided on yet.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or already resolved requests.
    async fn withdraw(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, ApprovalError>;

    /// Lists the requests still waiting for a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    async fn pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError>;
}

/// Approval service backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryApprovals {
    requests: RwLock<HashMap<ApprovalRequestId, ApprovalRequest>>,
}

impl InMemoryApprovals {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalService for InMemoryApprovals {
    async fn request_approval(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
        action: &ProposedAction,
    ) -> Result<ApprovalRequestId, ApprovalError> {
        let request = ApprovalRequest::new(run_id, node_id.clone(), action.clone());
        let id = request.id;
        self.requests.write().await.insert(id, request);
        Ok(id)
    }

    async fn resolution(&self, id: &ApprovalRequestId) -> Result<ApprovalStatus, ApprovalError> {
        self.requests
            .read()
            .await
            .get(id)
            .map(|r| r.status)
            .ok_or(ApprovalError::NotFound { id: *id })
    }

    async fn resolve(
        &self,
        id: &ApprovalRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id)
            .ok_or(ApprovalError::NotFound { id: *id })?;
        request.settle(decision.into())?;
        Ok(request.clone())
    }

    async fn withdraw(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, ApprovalError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id)
            .ok_or(ApprovalError::NotFound { id: *id })?;
        request.settle(ApprovalStatus::Withdrawn)?;
        Ok(request.clone())
    }

    async fn pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let mut pending: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.id);
        Ok(pending)
    }
}

/// Approval service writing one enveloped `<id>.json` file per request.
#[derive(Debug, Clone)]
pub struct FileApprovals {
    dir: PathBuf,
}

impl FileApprovals {
    /// Creates a service over `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ApprovalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            ApprovalError::Storage(StoreError::Io {
                reason: e.to_string(),
            })
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &ApprovalRequestId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn load(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, ApprovalError> {
        let bytes = read_optional(&self.path_for(id))
            .await?
            .ok_or(ApprovalError::NotFound { id: *id })?;
        envelope::open(&bytes).map_err(|e| {
            ApprovalError::Storage(StoreError::Corrupted {
                key: id.to_string(),
                reason: e.to_string(),
            })
        })
    }

    async fn store(&self, request: &ApprovalRequest) -> Result<(), ApprovalError> {
        let bytes = envelope::seal(request).map_err(|e| {
            ApprovalError::Storage(StoreError::Corrupted {
                key: request.id.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(write_atomic(&self.path_for(&request.id), &bytes).await?)
    }
}

#[async_trait]
impl ApprovalService for FileApprovals {
    async fn request_approval(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
        action: &ProposedAction,
    ) -> Result<ApprovalRequestId, ApprovalError> {
        let request = ApprovalRequest::new(run_id, node_id.clone(), action.clone());
        self.store(&request).await?;
        Ok(request.id)
    }

    async fn resolution(&self, id: &ApprovalRequestId) -> Result<ApprovalStatus, ApprovalError> {
        Ok(self.load(id).await?.status)
    }

    async fn resolve(
        &self,
        id: &ApprovalRequestId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut request = self.load(id).await?;
        request.settle(decision.into())?;
        self.store(&request).await?;
        Ok(request)
    }

    async fn withdraw(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, ApprovalError> {
        let mut request = self.load(id).await?;
        request.settle(ApprovalStatus::Withdrawn)?;
        self.store(&request).await?;
        Ok(request)
    }

    async fn pending(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let mut pending = Vec::new();
        for stem in list_json_stems(&self.dir).await? {
            let Ok(id) = stem.parse::<ApprovalRequestId>() else {
                continue;
            };
            let request = self.load(&id).await?;
            if request.status == ApprovalStatus::Pending {
                pending.push(request);
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action() -> ProposedAction {
        ProposedAction::new(
            "POST https://api.example.com/send",
            json!({"method": "POST", "url": "https://api.example.com/send"}),
        )
    }

    async fn exercise(service: &dyn ApprovalService) {
        let run_id = WorkflowRunId::new();
        let id = service
            .request_approval(run_id, &NodeId::from("send"), &action())
            .await
            .expect("request");

        assert_eq!(service.resolution(&id).await.expect("status"), ApprovalStatus::Pending);
        let pending = service.pending().await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_id, run_id);

        let resolved = service
            .resolve(&id, ApprovalDecision::Approved)
            .await
            .expect("resolve");
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(resolved.resolved_at.is_some());
        assert!(service.pending().await.expect("pending").is_empty());

        assert!(matches!(
            service.resolve(&id, ApprovalDecision::Rejected).await,
            Err(ApprovalError::AlreadyResolved { .. })
        ));
        assert!(matches!(
            service.resolution(&ApprovalRequestId::new()).await,
            Err(ApprovalError::NotFound { .. })
        ));

        let stale = service
            .request_approval(run_id, &NodeId::from("send"), &action())
            .await
            .expect("request");
        let withdrawn = service.withdraw(&stale).await.expect("withdraw");
        assert_eq!(withdrawn.status, ApprovalStatus::Withdrawn);
        assert!(service.pending().await.expect("pending").is_empty());
        assert!(matches!(
            service.resolve(&stale, ApprovalDecision::Approved).await,
            Err(ApprovalError::AlreadyResolved {
                status: ApprovalStatus::Withdrawn,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn in_memory_approvals() {
        exercise(&InMemoryApprovals::new()).await;
    }

    #[tokio::test]
    async fn file_approvals() {
        let dir = tempfile::tempdir().expect("tempdir");
        exercise(&FileApprovals::new(dir.path()).expect("service")).await;
    }
}
