//! Integration tests for PostgresWorkflowStore
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p sagaflow-orchestrator --test postgres_integration_test -- --test-threads=1
//!
//! Every test returns early when DATABASE_URL is not set.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use sagaflow_orchestrator::persistence::{PostgresWorkflowStore, StoreError, WorkflowStore};
use sagaflow_orchestrator::workflow::{
    action_types, StepPlan, StepStatus, Workflow, WorkflowEventRecord, WorkflowStatus,
};
use sagaflow_orchestrator::{
    ExecutionResult, OrchestratorConfig, RunOutcome, StepInvocation, WorkflowServices,
};

/// Connect and migrate, or `None` when no database is configured
async fn create_test_store() -> Option<PostgresWorkflowStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL. Check DATABASE_URL.");
    let store = PostgresWorkflowStore::new(pool);
    store.migrate().await.expect("Failed to run migrations");
    Some(store)
}

/// Clean up test data for a specific workflow
async fn cleanup_workflow(store: &PostgresWorkflowStore, workflow_id: Uuid) {
    sqlx::query("DELETE FROM workflow_events WHERE workflow_id = $1")
        .bind(workflow_id)
        .execute(store.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM workflows WHERE workflow_id = $1")
        .bind(workflow_id)
        .execute(store.pool())
        .await
        .ok();
}

fn test_workflow(session_id: &str) -> Workflow {
    Workflow::builder(session_id, "load and summarise")
        .step(
            StepPlan::new(action_types::DATA_QUERY, "load", "SELECT 1")
                .with_compensation("drop_temp_table", json!({ "table": "tmp" })),
        )
        .step(StepPlan::new(action_types::RESPONSE_GENERATION, "answer", "summarise"))
        .build()
        .unwrap()
}

fn unique_session() -> String {
    format!("pg-test-{}", Uuid::now_v7())
}

#[tokio::test]
async fn test_create_and_get_workflow() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());

    store.create(&mut wf).await.unwrap();
    assert_eq!(wf.version, 1);

    let loaded = store.get(wf.workflow_id).await.unwrap();
    assert_eq!(loaded.workflow_id, wf.workflow_id);
    assert_eq!(loaded.status, WorkflowStatus::Pending);
    assert_eq!(loaded.steps.len(), 2);
    assert_eq!(loaded.compensations.len(), 1);
    assert_eq!(loaded.version, 1);

    let duplicate = store.create(&mut wf.clone()).await;
    assert!(matches!(duplicate, Err(StoreError::AlreadyExists(_))));

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_workflow_not_found() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let missing = Uuid::now_v7();
    assert!(matches!(
        store.get(missing).await,
        Err(StoreError::WorkflowNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn test_optimistic_concurrency_conflict() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    let mut stale = wf.clone();

    wf.transition_to(WorkflowStatus::Running).unwrap();
    store.update(&mut wf, vec![]).await.unwrap();
    assert_eq!(wf.version, 2);

    stale.transition_to(WorkflowStatus::Running).unwrap();
    let result = store.update(&mut stale, vec![]).await;
    assert!(matches!(
        result,
        Err(StoreError::StaleWrite { expected: 1, actual: 2, .. })
    ));

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_terminal_workflow_rejects_updates() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    wf.transition_to(WorkflowStatus::Cancelled).unwrap();
    store.update(&mut wf, vec![]).await.unwrap();

    wf.final_response = Some("after the fact".into());
    let result = store.update(&mut wf, vec![]).await;
    assert!(matches!(result, Err(StoreError::Terminal(_))));

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_lease_acquire_renew_release() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    let leased = store
        .acquire_lease(wf.workflow_id, "node-a", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(leased.lease.as_ref().unwrap().owner, "node-a");
    assert!(leased.version > wf.version);

    let result = store
        .acquire_lease(wf.workflow_id, "node-b", Duration::from_secs(60))
        .await;
    assert!(matches!(
        result,
        Err(StoreError::LeaseHeld { ref owner, .. }) if owner == "node-a"
    ));

    store
        .acquire_lease(wf.workflow_id, "node-a", Duration::from_secs(60))
        .await
        .unwrap();

    // Releasing someone else's lease is a no-op
    store.release_lease(wf.workflow_id, "node-b").await.unwrap();
    assert!(store.get(wf.workflow_id).await.unwrap().lease.is_some());

    store.release_lease(wf.workflow_id, "node-a").await.unwrap();
    assert!(store.get(wf.workflow_id).await.unwrap().lease.is_none());

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_lease_writes_advance_updated_at() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();
    let created = store.get(wf.workflow_id).await.unwrap().updated_at;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let leased = store
        .acquire_lease(wf.workflow_id, "node-a", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(leased.updated_at > created);
    assert_eq!(store.get(wf.workflow_id).await.unwrap().updated_at, leased.updated_at);

    tokio::time::sleep(Duration::from_millis(5)).await;
    store.release_lease(wf.workflow_id, "node-a").await.unwrap();
    let released = store.get(wf.workflow_id).await.unwrap();
    assert!(released.updated_at > leased.updated_at);
    // Silence is measured from the column, not the stale document copy
    assert_eq!(released.last_seen(), released.updated_at);

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    store
        .acquire_lease(wf.workflow_id, "node-a", Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let taken = store
        .acquire_lease(wf.workflow_id, "node-b", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(taken.lease.unwrap().owner, "node-b");

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_heartbeat_does_not_bump_version() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    let first = store.update_heartbeat(wf.workflow_id).await.unwrap();
    let second = store.update_heartbeat(wf.workflow_id).await.unwrap();
    assert!(second >= first);

    let loaded = store.get(wf.workflow_id).await.unwrap();
    assert_eq!(loaded.version, 1);
    // Postgres stores microseconds
    let stored = loaded.last_heartbeat.unwrap();
    assert!((second - stored).num_milliseconds().abs() < 1);

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_list_queries() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let session = unique_session();
    let mut first = test_workflow(&session);
    let mut second = test_workflow(&session);
    store.create(&mut first).await.unwrap();
    store.create(&mut second).await.unwrap();

    second.transition_to(WorkflowStatus::Running).unwrap();
    store.update(&mut second, vec![]).await.unwrap();

    let in_session = store.list_by_session(&session).await.unwrap();
    let ids: Vec<Uuid> = in_session.iter().map(|w| w.workflow_id).collect();
    assert_eq!(ids, vec![first.workflow_id, second.workflow_id]);

    let running = store.list_by_status(WorkflowStatus::Running).await.unwrap();
    assert!(running.iter().any(|w| w.workflow_id == second.workflow_id));
    assert!(!running.iter().any(|w| w.workflow_id == first.workflow_id));

    cleanup_workflow(&store, first.workflow_id).await;
    cleanup_workflow(&store, second.workflow_id).await;
}

#[tokio::test]
async fn test_events_are_appended() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    wf.transition_to(WorkflowStatus::Running).unwrap();
    wf.set_step_status(1, StepStatus::Dispatched).unwrap();
    let events = vec![
        WorkflowEventRecord::status_changed(
            wf.workflow_id,
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            sagaflow_orchestrator::workflow::Actor::Orchestrator,
        ),
        WorkflowEventRecord::step_changed(
            wf.workflow_id,
            1,
            StepStatus::Pending,
            StepStatus::Dispatched,
            sagaflow_orchestrator::workflow::Actor::StepExecutor,
        ),
    ];
    store.update(&mut wf, events).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_events WHERE workflow_id = $1")
        .bind(wf.workflow_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    // workflow_created + the two above
    assert_eq!(count, 3);

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_delete_workflow() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut wf = test_workflow(&unique_session());
    store.create(&mut wf).await.unwrap();

    store.delete(wf.workflow_id).await.unwrap();
    assert!(matches!(
        store.get(wf.workflow_id).await,
        Err(StoreError::WorkflowNotFound(_))
    ));

    cleanup_workflow(&store, wf.workflow_id).await;
}

#[tokio::test]
async fn test_workflow_runs_against_postgres() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let store = Arc::new(store);
    let services = WorkflowServices::new(store.clone(), OrchestratorConfig::default());
    services
        .executor
        .register_fn(action_types::DATA_QUERY, |_inv: StepInvocation| async {
            ExecutionResult::success(json!({ "rows": 3 }))
        })
        .unwrap();
    services
        .executor
        .register_fn(action_types::RESPONSE_GENERATION, |_inv: StepInvocation| async {
            ExecutionResult::success(json!({ "response": "three rows" }))
        })
        .unwrap();

    let wf = services
        .orchestrator
        .submit(test_workflow(&unique_session()))
        .await
        .unwrap();
    let outcome = services.orchestrator.run(wf.workflow_id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            final_response: "three rows".into()
        }
    );

    let stored = store.get(wf.workflow_id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.completed_steps, vec![1, 2]);
    assert!(stored.lease.is_none());

    cleanup_workflow(&store, wf.workflow_id).await;
}
