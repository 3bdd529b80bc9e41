//! Saga manager
//!
//! Undoes completed steps in reverse completion order by running the
//! compensation planned for each of them. A failed compensation never halts
//! the sweep: every remaining step is still attempted and the failures are
//! returned for manual remediation.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handler::{
    CompensationContext, CompensationHandler, CompensationOutcome, FnCompensationHandler,
};
use super::strategy::CompensationStrategy;
use crate::engine::{HandlerRegistry, RegistryError};
use crate::persistence::{StoreError, WorkflowStore};
use crate::workflow::{
    Actor, CompensationAction, CompensationRecord, CompensationStatus, EventType,
    InvalidStatusTransition, RollbackOutcome, Workflow, WorkflowError, WorkflowEventRecord,
    WorkflowStatus,
};

/// Attempts at recording an outcome while other writers move the document
const MAX_RECORD_ATTEMPTS: u32 = 3;

/// Errors from saga operations
///
/// Individual compensation failures are not errors; they are listed in the
/// [`CompensationReport`].
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Transition(#[from] InvalidStatusTransition),

    /// Terminal workflows are never compensated
    #[error("workflow {workflow_id} is {status}")]
    Terminal {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
}

/// A compensation that failed and needs an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step_id: u32,
    pub compensation_type: String,
    pub error: String,
}

/// What one compensation sweep did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationReport {
    pub workflow_id: Uuid,

    /// Steps whose compensation ran, in execution order
    pub executed: Vec<u32>,

    pub failed: Vec<CompensationFailure>,

    /// Completed steps with nothing pending to run
    pub skipped: Vec<u32>,

    /// Pending actions with no handler registered in this process
    pub unhandled: Vec<u32>,
}

impl CompensationReport {
    fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            executed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            unhandled: Vec::new(),
        }
    }

    pub fn is_fully_compensated(&self) -> bool {
        self.failed.is_empty() && self.unhandled.is_empty()
    }

    /// Some actions were left pending for a process that can run them
    pub fn has_unhandled(&self) -> bool {
        !self.unhandled.is_empty()
    }

    /// Number of compensations attempted in this sweep
    pub fn attempted(&self) -> usize {
        self.executed.len() + self.failed.len()
    }

    pub fn rollback_outcome(&self) -> RollbackOutcome {
        if self.is_fully_compensated() {
            RollbackOutcome::FullyCompensated
        } else {
            RollbackOutcome::PartiallyCompensated
        }
    }
}

/// Runs compensations for failed or cancelled workflows
pub struct SagaManager {
    store: Arc<dyn WorkflowStore>,
    handlers: HandlerRegistry<dyn CompensationHandler>,
}

impl SagaManager {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            handlers: HandlerRegistry::new("compensation type"),
        }
    }

    /// Register the handler for a compensation type (last write wins)
    pub fn register_compensation_handler(
        &self,
        compensation_type: &str,
        handler: Arc<dyn CompensationHandler>,
    ) -> Result<bool, RegistryError> {
        self.handlers.register(compensation_type, handler)
    }

    /// Register an async closure as a compensation handler
    pub fn register_fn<F, Fut>(
        &self,
        compensation_type: &str,
        func: F,
    ) -> Result<bool, RegistryError>
    where
        F: Fn(CompensationAction, CompensationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CompensationOutcome> + Send + 'static,
    {
        self.register_compensation_handler(
            compensation_type,
            Arc::new(FnCompensationHandler::new(func)),
        )
    }

    pub fn handlers(&self) -> &HandlerRegistry<dyn CompensationHandler> {
        &self.handlers
    }

    /// Undo every completed step, newest first
    pub async fn compensate_all(
        &self,
        workflow: &mut Workflow,
        reason: &str,
    ) -> Result<CompensationReport, SagaError> {
        self.sweep(workflow, 1, reason).await
    }

    /// Undo completed steps with id >= `from_step_id`, newest first
    pub async fn compensate_from(
        &self,
        workflow: &mut Workflow,
        from_step_id: u32,
        reason: &str,
    ) -> Result<CompensationReport, SagaError> {
        self.sweep(workflow, from_step_id, reason).await
    }

    /// Apply a strategy; `Manual` runs nothing and returns `None`
    pub async fn apply(
        &self,
        workflow: &mut Workflow,
        strategy: CompensationStrategy,
        reason: &str,
    ) -> Result<Option<CompensationReport>, SagaError> {
        match strategy {
            CompensationStrategy::CompensateAll => {
                self.compensate_all(workflow, reason).await.map(Some)
            }
            CompensationStrategy::CompensateFrom(step_id) => {
                self.compensate_from(workflow, step_id, reason).await.map(Some)
            }
            CompensationStrategy::Manual => {
                info!(workflow_id = %workflow.workflow_id, "manual strategy, leaving compensation to an operator");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    async fn sweep(
        &self,
        workflow: &mut Workflow,
        from_step_id: u32,
        reason: &str,
    ) -> Result<CompensationReport, SagaError> {
        if workflow.is_terminal() {
            return Err(SagaError::Terminal {
                workflow_id: workflow.workflow_id,
                status: workflow.status,
            });
        }

        let workflow_id = workflow.workflow_id;
        let mut report = CompensationReport::new(workflow_id);
        let order: Vec<u32> = workflow
            .completed_steps
            .iter()
            .rev()
            .copied()
            .filter(|step_id| *step_id >= from_step_id)
            .collect();

        for step_id in order {
            let action = match workflow.compensation_for_step(step_id) {
                Some(action) if action.is_pending() => action.clone(),
                Some(action) if action.is_executing() => {
                    warn!(%workflow_id, step_id, compensation_type = %action.compensation_type, "compensation was started elsewhere, outcome unknown");
                    report.failed.push(CompensationFailure {
                        step_id,
                        compensation_type: action.compensation_type.clone(),
                        error: "compensation was started but its outcome was never recorded".into(),
                    });
                    continue;
                }
                _ => {
                    report.skipped.push(step_id);
                    continue;
                }
            };

            let Some(handler) = self.handlers.get(&action.compensation_type) else {
                warn!(%workflow_id, step_id, compensation_type = %action.compensation_type, "no compensation handler registered, leaving action pending");
                report.unhandled.push(step_id);
                continue;
            };

            self.claim(workflow, &action, reason).await?;

            let ctx = CompensationContext::for_step(workflow, step_id, reason);
            let (status, error, result) = match handler.compensate(&action, &ctx).await {
                CompensationOutcome::Executed { result } => {
                    (CompensationStatus::Executed, None, result)
                }
                CompensationOutcome::Failed { error } => {
                    (CompensationStatus::Failed, Some(error), None)
                }
            };

            self.record(workflow, &action, status, error.clone(), result, reason)
                .await?;

            match error {
                None => {
                    info!(%workflow_id, step_id, compensation_type = %action.compensation_type, "compensation executed");
                    report.executed.push(step_id);
                }
                Some(error) => {
                    warn!(%workflow_id, step_id, compensation_type = %action.compensation_type, %error, "compensation failed");
                    report.failed.push(CompensationFailure {
                        step_id,
                        compensation_type: action.compensation_type.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            %workflow_id,
            executed = report.executed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            unhandled = report.unhandled.len(),
            "compensation sweep finished"
        );
        Ok(report)
    }

    /// Persist the claim on an action; the handler runs only after this succeeds
    async fn claim(
        &self,
        workflow: &mut Workflow,
        action: &CompensationAction,
        reason: &str,
    ) -> Result<(), SagaError> {
        workflow
            .compensation_for_step_mut(action.step_id)
            .ok_or(WorkflowError::StepNotFound(action.step_id))?
            .claim()?;

        let event = WorkflowEventRecord::new(
            workflow.workflow_id,
            EventType::CompensationStarted,
            Actor::SagaManager,
        )
        .with_step(action.step_id)
        .with_details(json!({
            "compensation_type": action.compensation_type,
            "action_id": action.action_id,
            "reason": reason,
        }));
        self.store.update(workflow, vec![event]).await?;
        Ok(())
    }

    /// Persist the outcome of a claimed action
    ///
    /// The handler has already run, so a lost write race reloads the
    /// document and records again instead of giving up.
    async fn record(
        &self,
        workflow: &mut Workflow,
        action: &CompensationAction,
        status: CompensationStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
        reason: &str,
    ) -> Result<(), SagaError> {
        let workflow_id = workflow.workflow_id;
        let event_type = match status {
            CompensationStatus::Failed => EventType::CompensationFailed,
            CompensationStatus::Pending
            | CompensationStatus::Executing
            | CompensationStatus::Executed => EventType::CompensationExecuted,
        };

        let mut attempt = 1;
        loop {
            let planned = workflow
                .compensation_for_step_mut(action.step_id)
                .ok_or(WorkflowError::StepNotFound(action.step_id))?;
            planned.finish(status, error.clone())?;
            let record = CompensationRecord::from_action(planned, result.clone());
            workflow.compensation_history.push(record);

            let event = WorkflowEventRecord::new(workflow_id, event_type, Actor::SagaManager)
                .with_step(action.step_id)
                .with_details(json!({
                    "compensation_type": action.compensation_type,
                    "action_id": action.action_id,
                    "error": error,
                    "reason": reason,
                }));

            match self.store.update(workflow, vec![event]).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_RECORD_ATTEMPTS => {
                    debug!(%workflow_id, step_id = action.step_id, attempt, error = %e, "workflow changed while compensating, recording again");
                    *workflow = self.store.get(workflow_id).await?;
                    attempt += 1;
                }
                Err(e) => {
                    error!(%workflow_id, step_id = action.step_id, error = %e, "compensation ran but its outcome was not recorded");
                    return Err(e.into());
                }
            }
        }
    }
}
