//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - The workflow document stored as JSONB
//! - Compare-and-swap on a `version` column, checked under `FOR UPDATE`
//! - Heartbeat and lease kept in their own columns so the narrow
//!   operations never rewrite the document
//! - Audit events inserted in the same transaction as the update

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{
    Actor, EventType, Lease, Workflow, WorkflowEventRecord, WorkflowStatus,
};

const SELECT_WORKFLOW: &str = r#"
    SELECT document, version, last_heartbeat, updated_at, lease_owner, lease_expires_at
    FROM workflows
"#;

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use sagaflow_orchestrator::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/sagaflow").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error)
    }

    async fn list_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let query = format!(
            "{} WHERE {} = $1 ORDER BY created_at, workflow_id",
            SELECT_WORKFLOW, clause
        );
        let rows = sqlx::query(&query)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list workflows: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(workflow_from_row).collect()
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    async fn create(&self, workflow: &mut Workflow) -> Result<(), StoreError> {
        check_invariants(workflow)?;

        let mut stored = workflow.clone();
        stored.version = 1;
        let document = to_document(&stored)?;

        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflows (
                workflow_id, session_id, status, version, document,
                last_heartbeat, created_at, updated_at
            )
            VALUES ($1, $2, $3, 1, $4, $5, $6, $7)
            ON CONFLICT (workflow_id) DO NOTHING
            "#,
        )
        .bind(stored.workflow_id)
        .bind(&stored.session_id)
        .bind(stored.status.as_str())
        .bind(&document)
        .bind(stored.last_heartbeat)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(stored.workflow_id));
        }

        let created = WorkflowEventRecord::new(
            stored.workflow_id,
            EventType::WorkflowCreated,
            Actor::Caller,
        )
        .with_transition("none", stored.status)
        .with_details(serde_json::json!({
            "session_id": stored.session_id,
            "task_type": stored.task_type,
            "steps": stored.steps.len(),
        }));
        insert_event(&mut tx, &created).await?;

        tx.commit().await.map_err(db_error)?;

        workflow.version = 1;
        debug!(workflow_id = %workflow.workflow_id, session_id = %workflow.session_id, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        let query = format!("{} WHERE workflow_id = $1", SELECT_WORKFLOW);
        let row = sqlx::query(&query)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get workflow: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self, workflow, events), fields(workflow_id = %workflow.workflow_id, version = workflow.version))]
    async fn update(
        &self,
        workflow: &mut Workflow,
        events: Vec<WorkflowEventRecord>,
    ) -> Result<(), StoreError> {
        let workflow_id = workflow.workflow_id;
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT version, status FROM workflows WHERE workflow_id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let stored_version = row.get::<i64, _>("version") as u64;
        let stored_status = parse_status(row.get("status"))?;
        check_update(stored_version, stored_status, workflow)?;

        let mut next = workflow.clone();
        next.version = stored_version + 1;
        next.updated_at = Utc::now();
        let document = to_document(&next)?;

        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET document = $2,
                status = $3,
                version = $4,
                last_heartbeat = GREATEST(last_heartbeat, $5),
                updated_at = $6
            WHERE workflow_id = $1
            RETURNING last_heartbeat
            "#,
        )
        .bind(workflow_id)
        .bind(&document)
        .bind(next.status.as_str())
        .bind(next.version as i64)
        .bind(next.last_heartbeat)
        .bind(next.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to update workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        for event in &events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(db_error)?;

        workflow.version = next.version;
        workflow.updated_at = next.updated_at;
        workflow.last_heartbeat = row.get("last_heartbeat");

        debug!(%workflow_id, version = workflow.version, events = events.len(), "updated workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            DELETE FROM workflows WHERE workflow_id = $1 RETURNING status
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status: String = row.get("status");
        let event = WorkflowEventRecord::new(workflow_id, EventType::WorkflowDeleted, Actor::Caller)
            .with_transition(status, "deleted");
        insert_event(&mut tx, &event).await?;

        tx.commit().await.map_err(db_error)?;

        debug!(%workflow_id, "deleted workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_by_session(&self, session_id: &str) -> Result<Vec<Workflow>, StoreError> {
        self.list_where("session_id", session_id).await
    }

    #[instrument(skip(self))]
    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, StoreError> {
        self.list_where("status", status.as_str()).await
    }

    async fn update_heartbeat(&self, workflow_id: Uuid) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET last_heartbeat = GREATEST(last_heartbeat, $2)
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record heartbeat: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(now)
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        workflow_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Workflow, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT status, lease_owner, lease_expires_at
            FROM workflows WHERE workflow_id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if parse_status(row.get("status"))?.is_terminal() {
            return Err(StoreError::Terminal(workflow_id));
        }

        let now = Utc::now();
        let current_owner: Option<String> = row.get("lease_owner");
        let current_expiry: Option<DateTime<Utc>> = row.get("lease_expires_at");
        if let (Some(current_owner), Some(expires_at)) = (current_owner, current_expiry) {
            if current_owner != owner && expires_at > now {
                return Err(StoreError::LeaseHeld {
                    workflow_id,
                    owner: current_owner,
                });
            }
        }

        let lease = Lease::new(owner, ttl);
        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET lease_owner = $2, lease_expires_at = $3, version = version + 1, updated_at = $4
            WHERE workflow_id = $1
            RETURNING document, version, last_heartbeat, updated_at, lease_owner, lease_expires_at
            "#,
        )
            .bind(workflow_id)
            .bind(&lease.owner)
            .bind(lease.expires_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;

        let event = WorkflowEventRecord::new(workflow_id, EventType::LeaseAcquired, Actor::Store)
            .with_details(serde_json::json!({ "owner": owner, "ttl_secs": ttl.as_secs() }));
        insert_event(&mut tx, &event).await?;

        tx.commit().await.map_err(db_error)?;

        let workflow = workflow_from_row(&row)?;
        debug!(%workflow_id, %owner, "acquired lease");
        Ok(workflow)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, workflow_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET lease_owner = NULL, lease_expires_at = NULL, version = version + 1, updated_at = $3
            WHERE workflow_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(workflow_id)
        .bind(owner)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            let event =
                WorkflowEventRecord::new(workflow_id, EventType::LeaseReleased, Actor::Store)
                    .with_details(serde_json::json!({ "owner": owner }));
            insert_event(&mut tx, &event).await?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn append_event(&self, event: WorkflowEventRecord) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        insert_event(&mut tx, &event).await?;
        tx.commit().await.map_err(db_error)
    }
}

async fn insert_event(
    tx: &mut Transaction<'static, Postgres>,
    event: &WorkflowEventRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_events (
            event_id, workflow_id, event_type, step_id, from_status, to_status,
            details, actor, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.event_id)
    .bind(event.workflow_id)
    .bind(event.event_type.as_str())
    .bind(event.step_id.map(|id| id as i32))
    .bind(&event.from_status)
    .bind(&event.to_status)
    .bind(&event.details)
    .bind(event.actor.as_str())
    .bind(event.timestamp)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        error!("Failed to append event: {}", e);
        StoreError::Database(e.to_string())
    })?;
    Ok(())
}

/// Rebuild a document, letting the columns override the JSON copy
fn workflow_from_row(row: &PgRow) -> Result<Workflow, StoreError> {
    let document: serde_json::Value = row.get("document");
    let mut workflow: Workflow = serde_json::from_value(document)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    workflow.version = row.get::<i64, _>("version") as u64;
    workflow.last_heartbeat = row.get("last_heartbeat");
    // Lease writes touch the column without rewriting the document
    workflow.updated_at = row.get("updated_at");

    let owner: Option<String> = row.get("lease_owner");
    let expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    workflow.lease = match (owner, expires_at) {
        (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
        _ => None,
    };

    Ok(workflow)
}

fn to_document(workflow: &Workflow) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(workflow).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_status(status: String) -> Result<WorkflowStatus, StoreError> {
    status.parse().map_err(StoreError::Serialization)
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
