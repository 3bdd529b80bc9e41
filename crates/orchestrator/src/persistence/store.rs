//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::workflow::{Workflow, WorkflowEventRecord, WorkflowStatus};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A workflow with this id already exists
    #[error("workflow already exists: {0}")]
    AlreadyExists(Uuid),

    /// Compare-and-swap failed: the caller's copy is out of date
    #[error("stale write for workflow {workflow_id}: expected version {expected}, found {actual}")]
    StaleWrite {
        workflow_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// Another owner holds an unexpired lease
    #[error("workflow {workflow_id} is leased by {owner}")]
    LeaseHeld { workflow_id: Uuid, owner: String },

    /// The stored workflow is terminal and can no longer be mutated
    #[error("workflow {0} is in a terminal state")]
    Terminal(Uuid),

    /// The document breaks a data-model invariant
    #[error("invariant violated for workflow {workflow_id}: {reason}")]
    InvariantViolation { workflow_id: Uuid, reason: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Lost a race with another writer; reload and decide again
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleWrite { .. } | Self::LeaseHeld { .. })
    }
}

/// Durable store for workflow documents and their audit log
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access.
///
/// Writes are guarded by the document `version`: [`update`](Self::update)
/// succeeds only if the stored version equals the caller's, and bumps it.
/// Every state-changing operation appends audit events; the core never
/// reads them back.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Persist a new workflow
    ///
    /// Sets `version` to 1 and appends a `workflow_created` event.
    async fn create(&self, workflow: &mut Workflow) -> Result<(), StoreError>;

    /// Load the current document
    async fn get(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;

    /// Conditionally replace the document and append `events`
    ///
    /// Fails with [`StoreError::StaleWrite`] if the stored version differs
    /// from `workflow.version`. On success the caller's copy gets the new
    /// version and `updated_at`. `last_heartbeat` never moves backwards.
    async fn update(
        &self,
        workflow: &mut Workflow,
        events: Vec<WorkflowEventRecord>,
    ) -> Result<(), StoreError>;

    /// Remove a workflow (explicit administrative operation)
    async fn delete(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of all workflows in a session, oldest first
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<Workflow>, StoreError>;

    /// Snapshot of all workflows with the given status, oldest first
    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, StoreError>;

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Refresh the liveness timestamp only
    ///
    /// Does not bump the version and does not append an event.
    async fn update_heartbeat(&self, workflow_id: Uuid) -> Result<DateTime<Utc>, StoreError>;

    // =========================================================================
    // Leases
    // =========================================================================

    /// Claim exclusive ownership for `ttl`
    ///
    /// The current owner may renew. Fails with [`StoreError::LeaseHeld`]
    /// while another owner's lease is unexpired. Returns the fresh document.
    async fn acquire_lease(
        &self,
        workflow_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Workflow, StoreError>;

    /// Give up ownership; a no-op if `owner` does not hold the lease
    async fn release_lease(&self, workflow_id: Uuid, owner: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Audit Log
    // =========================================================================

    /// Append an event without touching the document
    async fn append_event(&self, event: WorkflowEventRecord) -> Result<(), StoreError>;
}

/// Checks shared by store implementations before a conditional write
pub(crate) fn check_update(
    stored_version: u64,
    stored_status: WorkflowStatus,
    workflow: &Workflow,
) -> Result<(), StoreError> {
    if stored_version != workflow.version {
        return Err(StoreError::StaleWrite {
            workflow_id: workflow.workflow_id,
            expected: workflow.version,
            actual: stored_version,
        });
    }
    if stored_status.is_terminal() {
        return Err(StoreError::Terminal(workflow.workflow_id));
    }
    check_invariants(workflow)
}

pub(crate) fn check_invariants(workflow: &Workflow) -> Result<(), StoreError> {
    workflow
        .check_invariants()
        .map_err(|reason| StoreError::InvariantViolation {
            workflow_id: workflow.workflow_id,
            reason,
        })
}

/// Later of two optional heartbeats
pub(crate) fn latest_heartbeat(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let id = Uuid::now_v7();
        assert!(StoreError::StaleWrite {
            workflow_id: id,
            expected: 1,
            actual: 2
        }
        .is_conflict());
        assert!(StoreError::LeaseHeld {
            workflow_id: id,
            owner: "w".into()
        }
        .is_conflict());
        assert!(!StoreError::WorkflowNotFound(id).is_conflict());
    }

    #[test]
    fn test_latest_heartbeat() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(5);

        assert_eq!(latest_heartbeat(Some(earlier), Some(later)), Some(later));
        assert_eq!(latest_heartbeat(Some(later), Some(earlier)), Some(later));
        assert_eq!(latest_heartbeat(None, Some(earlier)), Some(earlier));
        assert_eq!(latest_heartbeat(None, None), None);
    }
}
