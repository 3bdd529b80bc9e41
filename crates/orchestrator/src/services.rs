// Service object graph
//
// Every orchestration service is constructed once at start-up and shared
// through this struct instead of process-wide accessors. Tests build an
// isolated graph per case with `WorkflowServices::in_memory`.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::engine::{Orchestrator, StepExecutor};
use crate::persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, WorkflowStore};
use crate::recovery::RecoveryManager;
use crate::reliability::{HeartbeatTracker, TimeoutSweeper};
use crate::saga::SagaManager;

/// All orchestration services, wired to one store
#[derive(Clone)]
pub struct WorkflowServices {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn WorkflowStore>,
    pub heartbeats: Arc<HeartbeatTracker>,
    pub executor: Arc<StepExecutor>,
    pub saga: Arc<SagaManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub recovery: Arc<RecoveryManager>,
    pub sweeper: Arc<TimeoutSweeper>,
}

impl WorkflowServices {
    /// Wire every service to `store`
    pub fn new(store: Arc<dyn WorkflowStore>, config: OrchestratorConfig) -> Self {
        let heartbeats = Arc::new(HeartbeatTracker::new(store.clone()));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            heartbeats.clone(),
            config.executor_config(),
        ));
        let saga = Arc::new(SagaManager::new(store.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            executor.clone(),
            saga.clone(),
            config.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            orchestrator.clone(),
            config.recovery_grace,
        ));
        let sweeper = Arc::new(TimeoutSweeper::new(
            heartbeats.clone(),
            orchestrator.clone(),
            config.sweep_interval,
            config.heartbeat_timeout,
        ));

        Self {
            config,
            store,
            heartbeats,
            executor,
            saga,
            orchestrator,
            recovery,
            sweeper,
        }
    }

    /// Services backed by a fresh in-memory store
    pub fn in_memory(config: OrchestratorConfig) -> Self {
        Self::new(Arc::new(InMemoryWorkflowStore::new()), config)
    }

    /// Services backed by Postgres when `database_url` is set, in-memory otherwise
    ///
    /// Applies the schema migrations before returning.
    pub async fn connect(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let Some(url) = config.database_url.clone() else {
            info!("DATABASE_URL not set, using in-memory workflow store");
            return Ok(Self::in_memory(config));
        };

        let pool = PgPool::connect(&url)
            .await
            .context("Failed to connect to Postgres")?;
        let store = PostgresWorkflowStore::new(pool);
        store
            .migrate()
            .await
            .context("Failed to run workflow store migrations")?;

        info!("Connected to Postgres workflow store");
        Ok(Self::new(Arc::new(store), config))
    }
}
