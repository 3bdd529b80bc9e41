//! Recovery manager
//!
//! Entry point after a restart or a user reconnect: lists the workflows of
//! a session that can be picked up again, resumes one through the
//! orchestration loop, or cancels it (optionally rolling it back first).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::{Orchestrator, OrchestratorError, RunOutcome};
use crate::handler::StepError;
use crate::persistence::{StoreError, WorkflowStore};
use crate::saga::{CompensationReport, SagaError, SagaManager};
use crate::workflow::{
    Actor, InvalidStatusTransition, RollbackOutcome, Workflow, WorkflowEventRecord,
    WorkflowStatus,
};

/// Attempts at cancelling before giving up on a contended workflow
const MAX_CANCEL_ATTEMPTS: u32 = 3;

/// Errors from recovery operations
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    InvalidStatusTransition(#[from] InvalidStatusTransition),

    /// Another owner holds the write lease
    #[error("workflow {workflow_id} is owned by {owner}")]
    Conflict { workflow_id: Uuid, owner: String },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("saga error: {0}")]
    Saga(SagaError),

    #[error("orchestrator error: {0}")]
    Orchestrator(OrchestratorError),
}

impl From<StoreError> for RecoveryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::WorkflowNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<OrchestratorError> for RecoveryError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::Conflict { workflow_id, owner } => {
                Self::Conflict { workflow_id, owner }
            }
            OrchestratorError::Transition(e) => Self::InvalidStatusTransition(e),
            OrchestratorError::Store(e) => e.into(),
            other => Self::Orchestrator(other),
        }
    }
}

/// Result of a cancellation
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// The workflow as persisted in CANCELLED
    pub workflow: Workflow,

    pub rollback: RollbackOutcome,

    /// Compensations run by a forced cancel
    pub report: Option<CompensationReport>,
}

/// Resumes or cancels workflows after an interruption
pub struct RecoveryManager {
    store: Arc<dyn WorkflowStore>,
    orchestrator: Arc<Orchestrator>,
    saga: Arc<SagaManager>,
    grace_window: Duration,
}

impl RecoveryManager {
    pub fn new(orchestrator: Arc<Orchestrator>, grace_window: Duration) -> Self {
        Self {
            store: orchestrator.store().clone(),
            saga: orchestrator.saga().clone(),
            orchestrator,
            grace_window,
        }
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// RUNNING or PAUSED workflows of a session that were active recently
    ///
    /// "Recently" means within the grace window, measured from the last
    /// heartbeat or, without one, the last update.
    #[instrument(skip(self))]
    pub async fn get_recoverable_workflows(
        &self,
        session_id: &str,
    ) -> Result<Vec<Workflow>, RecoveryError> {
        let now = Utc::now();
        let workflows = self.store.list_by_session(session_id).await?;

        Ok(workflows
            .into_iter()
            .filter(|w| matches!(w.status, WorkflowStatus::Running | WorkflowStatus::Paused))
            .filter(|w| w.silence(now) <= self.grace_window)
            .collect())
    }

    /// Take the lease and re-enter the orchestration loop
    ///
    /// Terminal and FAILED workflows are rejected without being touched.
    #[instrument(skip(self, user_response))]
    pub async fn resume(
        &self,
        workflow_id: Uuid,
        user_response: Option<String>,
    ) -> Result<RunOutcome, RecoveryError> {
        let workflow = self.store.get(workflow_id).await?;
        match workflow.status {
            WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Paused => {}
            WorkflowStatus::Failed | WorkflowStatus::Completed | WorkflowStatus::Cancelled => {
                return Err(InvalidStatusTransition::new(
                    "workflow",
                    workflow.status,
                    WorkflowStatus::Running,
                )
                .into());
            }
        }

        info!(%workflow_id, status = %workflow.status, current_step = workflow.current_step, "resuming workflow");
        match self.orchestrator.resume(workflow_id, user_response).await {
            Ok(outcome) => Ok(outcome),
            // Went terminal between the check and the lease
            Err(OrchestratorError::Store(StoreError::Terminal(_))) => {
                let status = self.store.get(workflow_id).await?.status;
                Err(InvalidStatusTransition::new("workflow", status, WorkflowStatus::Running).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a workflow to CANCELLED
    ///
    /// With `force`, completed steps are compensated first. Takes no lease:
    /// a running loop sees the status at its next step boundary and
    /// discards any in-flight result. Each compensation is claimed in the
    /// store before its handler runs, so a retry after a lost write race
    /// never runs it twice.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        workflow_id: Uuid,
        force: bool,
    ) -> Result<CancelOutcome, RecoveryError> {
        let mut report: Option<CompensationReport> = None;
        let mut last_error = None;

        for attempt in 1..=MAX_CANCEL_ATTEMPTS {
            let mut workflow = self.store.get(workflow_id).await?;
            if workflow.is_terminal() {
                return Err(InvalidStatusTransition::new(
                    "workflow",
                    workflow.status,
                    WorkflowStatus::Cancelled,
                )
                .into());
            }

            if force {
                match self.saga.compensate_all(&mut workflow, "cancelled by user").await {
                    Ok(sweep) => absorb(&mut report, sweep),
                    Err(SagaError::Store(e)) if e.is_conflict() => {
                        warn!(%workflow_id, attempt, "workflow changed during compensation, retrying");
                        last_error = Some(e);
                        continue;
                    }
                    Err(SagaError::Terminal { status, .. }) => {
                        return Err(InvalidStatusTransition::new(
                            "workflow",
                            status,
                            WorkflowStatus::Cancelled,
                        )
                        .into());
                    }
                    Err(e) => return Err(RecoveryError::Saga(e)),
                }
            }

            let rollback = match &report {
                Some(report) => report.rollback_outcome(),
                None => RollbackOutcome::NotCompensated,
            };
            workflow.rollback = Some(rollback);
            if workflow.error.is_none() {
                workflow.error = Some(StepError::user_cancelled("cancelled by user"));
            }
            let from = workflow.transition_to(WorkflowStatus::Cancelled)?;
            let event = WorkflowEventRecord::status_changed(
                workflow_id,
                from,
                WorkflowStatus::Cancelled,
                Actor::RecoveryManager,
            )
            .with_details(json!({ "force": force, "rollback": rollback }));

            match self.store.update(&mut workflow, vec![event]).await {
                Ok(()) => {
                    info!(%workflow_id, force, ?rollback, "workflow cancelled");
                    return Ok(CancelOutcome {
                        workflow,
                        rollback,
                        report,
                    });
                }
                Err(e) if e.is_conflict() => {
                    warn!(%workflow_id, attempt, "workflow changed during cancel, retrying");
                    last_error = Some(e);
                }
                Err(StoreError::Terminal(_)) => {
                    let status = self.store.get(workflow_id).await?.status;
                    return Err(InvalidStatusTransition::new(
                        "workflow",
                        status,
                        WorkflowStatus::Cancelled,
                    )
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(match last_error {
            Some(StoreError::LeaseHeld { owner, .. }) => RecoveryError::Conflict { workflow_id, owner },
            Some(e) => RecoveryError::Store(e),
            None => RecoveryError::NotFound(workflow_id),
        })
    }
}

/// Fold a later sweep into the running total
fn absorb(total: &mut Option<CompensationReport>, sweep: CompensationReport) {
    match total {
        Some(total) => {
            total.executed.extend(sweep.executed);
            total.failed.extend(sweep.failed);
            total.skipped = sweep.skipped;
            total.unhandled = sweep.unhandled;
        }
        None => *total = Some(sweep),
    }
}
