//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{
    Actor, EventType, Lease, Workflow, WorkflowEventRecord, WorkflowStatus,
};

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing and single-process deployments. It
/// provides the same semantics as the PostgreSQL implementation and
/// mirrors every audit event to `tracing` at debug level.
///
/// # Example
///
/// ```
/// use sagaflow_orchestrator::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    events: RwLock<Vec<WorkflowEventRecord>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Audit events recorded for a workflow, in append order
    pub fn events_for(&self, workflow_id: Uuid) -> Vec<WorkflowEventRecord> {
        self.events
            .read()
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    /// Overwrite the stored heartbeat (for simulating silence in tests)
    pub fn set_last_heartbeat(
        &self,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.last_heartbeat = Some(at);
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.events.write().clear();
    }

    fn record(&self, events: impl IntoIterator<Item = WorkflowEventRecord>) {
        let mut log = self.events.write();
        for event in events {
            debug!(
                workflow_id = %event.workflow_id,
                event_type = %event.event_type,
                step_id = ?event.step_id,
                from = ?event.from_status,
                to = ?event.to_status,
                actor = %event.actor,
                "audit event"
            );
            log.push(event);
        }
    }

    fn snapshot(&self, filter: impl Fn(&Workflow) -> bool) -> Vec<Workflow> {
        let mut found: Vec<Workflow> = self
            .workflows
            .read()
            .values()
            .filter(|w| filter(w))
            .cloned()
            .collect();
        found.sort_by_key(|w| (w.created_at, w.workflow_id));
        found
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, workflow: &mut Workflow) -> Result<(), StoreError> {
        check_invariants(workflow)?;

        {
            let mut workflows = self.workflows.write();
            if workflows.contains_key(&workflow.workflow_id) {
                return Err(StoreError::AlreadyExists(workflow.workflow_id));
            }
            workflow.version = 1;
            workflows.insert(workflow.workflow_id, workflow.clone());
        }

        self.record([WorkflowEventRecord::new(
            workflow.workflow_id,
            EventType::WorkflowCreated,
            Actor::Caller,
        )
        .with_transition("none", workflow.status)
        .with_details(serde_json::json!({
            "session_id": workflow.session_id,
            "task_type": workflow.task_type,
            "steps": workflow.steps.len(),
        }))]);
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn update(
        &self,
        workflow: &mut Workflow,
        events: Vec<WorkflowEventRecord>,
    ) -> Result<(), StoreError> {
        {
            let mut workflows = self.workflows.write();
            let stored = workflows
                .get_mut(&workflow.workflow_id)
                .ok_or(StoreError::WorkflowNotFound(workflow.workflow_id))?;

            check_update(stored.version, stored.status, workflow)?;

            workflow.version = stored.version + 1;
            workflow.updated_at = Utc::now();
            workflow.last_heartbeat = latest_heartbeat(stored.last_heartbeat, workflow.last_heartbeat);
            // Leases only change through acquire/release
            workflow.lease = stored.lease.clone();
            *stored = workflow.clone();
        }

        self.record(events);
        Ok(())
    }

    async fn delete(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let removed = self.workflows.write().remove(&workflow_id);
        let workflow = removed.ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        self.record([WorkflowEventRecord::new(
            workflow_id,
            EventType::WorkflowDeleted,
            Actor::Caller,
        )
        .with_transition(workflow.status, "deleted")]);
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.snapshot(|w| w.session_id == session_id))
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.snapshot(|w| w.status == status))
    }

    async fn update_heartbeat(&self, workflow_id: Uuid) -> Result<DateTime<Utc>, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let now = Utc::now();
        workflow.last_heartbeat = latest_heartbeat(workflow.last_heartbeat, Some(now));
        Ok(now)
    }

    async fn acquire_lease(
        &self,
        workflow_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Workflow, StoreError> {
        let acquired = {
            let mut workflows = self.workflows.write();
            let stored = workflows
                .get_mut(&workflow_id)
                .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

            if stored.is_terminal() {
                return Err(StoreError::Terminal(workflow_id));
            }

            let now = Utc::now();
            if let Some(lease) = &stored.lease {
                if lease.owner != owner && !lease.is_expired(now) {
                    return Err(StoreError::LeaseHeld {
                        workflow_id,
                        owner: lease.owner.clone(),
                    });
                }
            }

            let lease = Lease::new(owner, ttl);
            stored.lease = Some(lease);
            stored.version += 1;
            stored.updated_at = now;
            stored.clone()
        };

        self.record([WorkflowEventRecord::new(
            workflow_id,
            EventType::LeaseAcquired,
            Actor::Store,
        )
        .with_details(serde_json::json!({ "owner": owner, "ttl_secs": ttl.as_secs() }))]);
        Ok(acquired)
    }

    async fn release_lease(&self, workflow_id: Uuid, owner: &str) -> Result<(), StoreError> {
        {
            let mut workflows = self.workflows.write();
            let stored = workflows
                .get_mut(&workflow_id)
                .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

            match &stored.lease {
                Some(lease) if lease.owner == owner => {
                    stored.lease = None;
                    stored.version += 1;
                    stored.updated_at = Utc::now();
                }
                _ => return Ok(()),
            }
        }

        self.record([WorkflowEventRecord::new(
            workflow_id,
            EventType::LeaseReleased,
            Actor::Store,
        )
        .with_details(serde_json::json!({ "owner": owner }))]);
        Ok(())
    }

    async fn append_event(&self, event: WorkflowEventRecord) -> Result<(), StoreError> {
        self.record([event]);
        Ok(())
    }
}
