//! # Sagaflow Orchestrator
//!
//! A multi-tenant workflow orchestration core for long-running, multi-step
//! tasks whose steps are not transactional.
//!
//! ## Features
//!
//! - **Durable progress**: every step transition is persisted before it is acted on, so a crashed process can resume where it left off
//! - **Saga rollback**: completed steps are undone in reverse completion order through registered compensation handlers
//! - **Liveness detection**: in-flight steps refresh a heartbeat; silent steps are detected and failed
//! - **Automatic retries**: per-step retry budgets with exponential backoff and jitter
//! - **Single owner**: leases and compare-and-swap writes keep two actors from advancing the same workflow
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              RecoveryManager / TimeoutSweeper                │
//! │  (resume or cancel after restarts, fail silent steps)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (lease, step-boundary checks, failure -> SagaManager)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          StepExecutor + HeartbeatTracker + handlers          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL: workflows, workflow_events; or in-memory)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sagaflow_orchestrator::prelude::*;
//!
//! let services = WorkflowServices::in_memory(OrchestratorConfig::default());
//! services.executor.register_fn("data_query", |inv: StepInvocation| async move {
//!     ExecutionResult::success(json!({ "rows": 42 }))
//! })?;
//! services.saga.register_fn("drop_temp_table", |action, _ctx| async move {
//!     CompensationOutcome::executed()
//! })?;
//!
//! let workflow = services
//!     .orchestrator
//!     .plan("session-1", "How many orders shipped last week?")
//!     .step(StepPlan::new("data_query", "Count orders", "SELECT ...")
//!         .with_compensation("drop_temp_table", json!({ "table": "tmp_orders" })))
//!     .build()?;
//! let workflow = services.orchestrator.submit(workflow).await?;
//!
//! match services.orchestrator.run(workflow.workflow_id).await? {
//!     RunOutcome::Completed { final_response } => println!("{final_response}"),
//!     other => println!("workflow stopped: {other:?}"),
//! }
//! ```

pub mod config;
pub mod engine;
pub mod handler;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod saga;
pub mod services;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, Orchestrator, OrchestratorError, RunOutcome, StepExecutor,
        StepOutcome,
    };
    pub use crate::handler::{
        ExecutionResult, StepContext, StepError, StepErrorKind, StepHandler, StepInvocation,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::recovery::{CancelOutcome, RecoveryError, RecoveryManager};
    pub use crate::reliability::{HeartbeatTracker, RetryPolicy, TimeoutSweeper};
    pub use crate::saga::{
        CompensationContext, CompensationHandler, CompensationOutcome, CompensationReport,
        CompensationStrategy, SagaManager,
    };
    pub use crate::services::WorkflowServices;
    pub use crate::workflow::{
        action_types, CompensationAction, Step, StepPlan, StepResults, StepStatus, Workflow,
        WorkflowStatus,
    };
    pub use serde_json::json;
}

// Re-export key types at crate root
pub use config::OrchestratorConfig;
pub use engine::{
    ExecutorConfig, ExecutorError, HandlerRegistry, Orchestrator, OrchestratorError,
    RegistryError, RunOutcome, StepExecutor, StepJob, StepOutcome,
};
pub use handler::{
    ExecutionResult, FnStepHandler, StepContext, StepError, StepErrorKind, StepHandler,
    StepInvocation,
};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use recovery::{CancelOutcome, RecoveryError, RecoveryManager};
pub use reliability::{HeartbeatTracker, RetryPolicy, SweepReport, TimedOutStep, TimeoutSweeper};
pub use saga::{
    CompensationContext, CompensationHandler, CompensationOutcome, CompensationReport,
    CompensationStrategy, FnCompensationHandler, SagaError, SagaManager,
};
pub use services::WorkflowServices;
pub use workflow::{
    ActionType, CompensationAction, CompensationRecord, InvalidStatusTransition, PlanError,
    RollbackOutcome, Step, StepPlan, StepResults, StepStatus, Workflow, WorkflowError,
    WorkflowEventRecord, WorkflowStatus,
};
