//! Orchestration loop
//!
//! The `Orchestrator` owns a workflow while it advances it: it takes the
//! write lease, runs steps strictly one at a time through the
//! [`StepExecutor`], checks the stored document at every step boundary, and
//! hands terminal failures to the [`SagaManager`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorError, StepExecutor, StepOutcome};
use crate::config::OrchestratorConfig;
use crate::handler::StepError;
use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::TimedOutStep;
use crate::saga::{CompensationReport, CompensationStrategy, SagaError, SagaManager};
use crate::workflow::{
    Actor, EventType, InvalidStatusTransition, StepStatus, Workflow, WorkflowBuilder,
    WorkflowError, WorkflowEventRecord, WorkflowStatus,
};

/// Errors from orchestration
///
/// Step and compensation failures are reported through [`RunOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("saga error: {0}")]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Transition(#[from] InvalidStatusTransition),

    /// Another owner holds the write lease
    #[error("workflow {workflow_id} is owned by {owner}")]
    Conflict { workflow_id: Uuid, owner: String },
}

/// Where a run left the workflow
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every step completed
    Completed { final_response: String },

    /// A step is waiting for user input
    Paused { step_id: u32, prompt: String },

    /// A step failed and the compensation strategy ran; the workflow is CANCELLED
    RolledBack {
        step_id: u32,
        error: StepError,
        report: CompensationReport,
    },

    /// A step failed and the workflow was left FAILED for an operator
    Failed { step_id: u32, error: StepError },

    /// The workflow was cancelled by another actor
    Cancelled,

    /// Another owner took over the workflow
    Superseded,
}

enum Entry {
    Start,
    Resume { user_response: Option<String> },
}

/// Drives workflows from step to step
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<StepExecutor>,
    saga: Arc<SagaManager>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<StepExecutor>,
        saga: Arc<SagaManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            executor,
            saga,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn saga(&self) -> &Arc<SagaManager> {
        &self.saga
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start a plan with this orchestrator's default retry budget
    pub fn plan(
        &self,
        session_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> WorkflowBuilder {
        Workflow::builder(session_id, instruction)
            .default_max_retries(self.config.retry.max_retries)
    }

    /// Persist a new workflow in PENDING
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    pub async fn submit(&self, mut workflow: Workflow) -> Result<Workflow, OrchestratorError> {
        self.store.create(&mut workflow).await?;
        info!(
            workflow_id = %workflow.workflow_id,
            session_id = %workflow.session_id,
            steps = workflow.steps.len(),
            "workflow submitted"
        );
        Ok(workflow)
    }

    /// Advance a workflow until it completes, pauses, or fails
    #[instrument(skip(self))]
    pub async fn run(&self, workflow_id: Uuid) -> Result<RunOutcome, OrchestratorError> {
        self.drive(workflow_id, Entry::Start).await
    }

    /// Re-enter the loop at the current step
    ///
    /// A PAUSED workflow is moved back to RUNNING and `user_response` is
    /// stored on the step that asked for input. A step left in flight by a
    /// crashed owner is re-attempted if its handler is idempotent, and
    /// failed otherwise.
    #[instrument(skip(self, user_response))]
    pub async fn resume(
        &self,
        workflow_id: Uuid,
        user_response: Option<String>,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.drive(workflow_id, Entry::Resume { user_response }).await
    }

    /// Fail a workflow whose in-flight step stopped sending heartbeats
    ///
    /// Returns `None` if the workflow moved on since detection. Takes no
    /// lease: the owner is presumed dead, and a live one loses the
    /// compare-and-swap race and discards its result. A process with no
    /// compensation handlers only marks the workflow FAILED and leaves the
    /// rollback to one that has them.
    #[instrument(skip(self, timed_out), fields(workflow_id = %timed_out.workflow_id, step_id = timed_out.step_id))]
    pub async fn fail_timed_out(
        &self,
        timed_out: &TimedOutStep,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let mut workflow = self.store.get(timed_out.workflow_id).await?;
        let step_id = timed_out.step_id;

        if workflow.status != WorkflowStatus::Running {
            return Ok(None);
        }
        let from = match workflow.step(step_id) {
            Some(step) if step.status.is_in_flight() => step.status,
            _ => return Ok(None),
        };
        if workflow.last_seen() > timed_out.last_seen {
            debug!("heartbeat arrived after detection, skipping");
            return Ok(None);
        }

        let silence = workflow.silence(Utc::now());
        let error = StepError::timeout(format!(
            "no heartbeat for {}s",
            silence.as_secs()
        ));
        workflow.record_step_failed(step_id, error.clone())?;

        let events = vec![
            WorkflowEventRecord::new(workflow.workflow_id, EventType::HeartbeatTimedOut, Actor::Sweeper)
                .with_step(step_id)
                .with_details(json!({
                    "last_seen": timed_out.last_seen,
                    "silence_secs": silence.as_secs(),
                })),
            WorkflowEventRecord::step_changed(
                workflow.workflow_id,
                step_id,
                from,
                StepStatus::Failed,
                Actor::Sweeper,
            )
            .with_details(json!({ "error": error })),
        ];
        self.store.update(&mut workflow, events).await?;

        warn!(silence_secs = silence.as_secs(), "step timed out");
        let strategy = if self.saga.handlers().is_empty() {
            CompensationStrategy::Manual
        } else {
            self.config.compensation_strategy
        };
        self.fail_workflow(&mut workflow, step_id, error, Actor::Sweeper, strategy)
            .await
            .map(Some)
    }

    async fn drive(&self, workflow_id: Uuid, entry: Entry) -> Result<RunOutcome, OrchestratorError> {
        let token = format!("{}:{}", self.config.owner_id, Uuid::now_v7());
        let mut workflow = self
            .store
            .acquire_lease(workflow_id, &token, self.config.lease_ttl)
            .await
            .map_err(|e| lease_error(e, workflow_id))?;

        let result = self.drive_leased(&mut workflow, &token, entry).await;

        if let Err(e) = self.store.release_lease(workflow_id, &token).await {
            warn!(%workflow_id, error = %e, "failed to release lease");
        }
        result
    }

    async fn drive_leased(
        &self,
        workflow: &mut Workflow,
        token: &str,
        entry: Entry,
    ) -> Result<RunOutcome, OrchestratorError> {
        match workflow.status {
            WorkflowStatus::Pending => self.start(workflow).await?,
            WorkflowStatus::Paused => match entry {
                Entry::Start => return Ok(paused_outcome(workflow)),
                Entry::Resume { user_response } => self.unpause(workflow, user_response).await?,
            },
            WorkflowStatus::Running => {
                if let Some(outcome) = self.reclaim_in_flight(workflow).await? {
                    return Ok(outcome);
                }
            }
            WorkflowStatus::Failed | WorkflowStatus::Completed | WorkflowStatus::Cancelled => {
                return Err(InvalidStatusTransition::new(
                    "workflow",
                    workflow.status,
                    WorkflowStatus::Running,
                )
                .into());
            }
        }

        self.advance(workflow, token).await
    }

    async fn start(&self, workflow: &mut Workflow) -> Result<(), OrchestratorError> {
        let from = workflow.transition_to(WorkflowStatus::Running)?;
        let event = WorkflowEventRecord::status_changed(
            workflow.workflow_id,
            from,
            WorkflowStatus::Running,
            Actor::Orchestrator,
        );
        self.store.update(workflow, vec![event]).await?;
        info!(workflow_id = %workflow.workflow_id, "workflow started");
        Ok(())
    }

    async fn unpause(
        &self,
        workflow: &mut Workflow,
        user_response: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let workflow_id = workflow.workflow_id;
        let awaiting = workflow.awaiting_input.take();
        let from = workflow.transition_to(WorkflowStatus::Running)?;
        let mut events = vec![WorkflowEventRecord::status_changed(
            workflow_id,
            from,
            WorkflowStatus::Running,
            Actor::Orchestrator,
        )];

        match (awaiting, user_response) {
            (Some(awaiting), Some(response)) => {
                let step = workflow
                    .step_mut(awaiting.step_id)
                    .ok_or(WorkflowError::StepNotFound(awaiting.step_id))?;
                step.user_response = Some(response);
                events.push(
                    WorkflowEventRecord::new(workflow_id, EventType::UserInputReceived, Actor::Caller)
                        .with_step(awaiting.step_id)
                        .with_details(json!({ "prompt": awaiting.prompt })),
                );
            }
            (None, Some(_)) => {
                debug!(%workflow_id, "no step is awaiting input, ignoring user response");
            }
            (_, None) => {}
        }

        self.store.update(workflow, events).await?;
        info!(%workflow_id, "workflow resumed");
        Ok(())
    }

    /// Deal with a step left DISPATCHED or EXECUTING by a previous owner
    async fn reclaim_in_flight(
        &self,
        workflow: &mut Workflow,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let Some(step) = workflow.steps.iter().find(|s| s.status.is_in_flight()) else {
            return Ok(None);
        };
        let step_id = step.step_id;
        let from = step.status;
        let idempotent = self
            .executor
            .handler(step.action_type.as_str())
            .map_or(true, |handler| handler.is_idempotent());

        if idempotent {
            workflow.set_step_status(step_id, StepStatus::Pending)?;
            let event = WorkflowEventRecord::step_changed(
                workflow.workflow_id,
                step_id,
                from,
                StepStatus::Pending,
                Actor::Orchestrator,
            )
            .with_details(json!({ "reason": "reclaimed after interruption" }));
            self.store.update(workflow, vec![event]).await?;

            info!(workflow_id = %workflow.workflow_id, step_id, "re-attempting interrupted step");
            return Ok(None);
        }

        let error = StepError::non_retryable(format!(
            "step {} was interrupted and its handler is not idempotent; outcome unknown",
            step_id
        ));
        workflow.record_step_failed(step_id, error.clone())?;
        let event = WorkflowEventRecord::step_changed(
            workflow.workflow_id,
            step_id,
            from,
            StepStatus::Failed,
            Actor::Orchestrator,
        )
        .with_details(json!({ "error": error }));
        self.store.update(workflow, vec![event]).await?;

        warn!(workflow_id = %workflow.workflow_id, step_id, "interrupted step is not idempotent");
        let strategy = self.config.compensation_strategy;
        self.fail_workflow(workflow, step_id, error, Actor::Orchestrator, strategy)
            .await
            .map(Some)
    }

    async fn advance(
        &self,
        workflow: &mut Workflow,
        token: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        let workflow_id = workflow.workflow_id;
        let strategy = self.config.compensation_strategy;

        loop {
            // Step boundary: decide from the stored document only
            *workflow = self.store.get(workflow_id).await?;

            match workflow.status {
                WorkflowStatus::Running => {}
                WorkflowStatus::Pending => {
                    self.start(workflow).await?;
                    continue;
                }
                WorkflowStatus::Paused => return Ok(paused_outcome(workflow)),
                WorkflowStatus::Completed => {
                    return Ok(RunOutcome::Completed {
                        final_response: workflow.final_response.clone().unwrap_or_default(),
                    });
                }
                WorkflowStatus::Cancelled => {
                    info!(%workflow_id, "workflow cancelled, stopping");
                    return Ok(RunOutcome::Cancelled);
                }
                WorkflowStatus::Failed => {
                    let step_id = workflow.failed_steps.last().copied().unwrap_or(workflow.current_step);
                    let error = workflow
                        .error
                        .clone()
                        .unwrap_or_else(|| StepError::non_retryable("workflow failed"));
                    return Ok(RunOutcome::Failed { step_id, error });
                }
            }

            if !self.hold_lease(workflow, token).await? {
                warn!(%workflow_id, "lease taken over by another owner");
                return Ok(RunOutcome::Superseded);
            }

            if workflow.all_steps_completed() {
                return self.complete(workflow).await;
            }

            // Steps run strictly in order: the first unfinished one is next
            let Some(step) = workflow.steps.iter().find(|s| s.status != StepStatus::Completed)
            else {
                return self.complete(workflow).await;
            };
            let step_id = step.step_id;

            if step.status == StepStatus::Failed && !step.can_retry() {
                let error = step
                    .error
                    .clone()
                    .unwrap_or_else(|| StepError::non_retryable("step failed"));
                return self
                    .fail_workflow(workflow, step_id, error, Actor::Orchestrator, strategy)
                    .await;
            }

            match self.executor.execute_step(workflow, step_id).await {
                Ok(StepOutcome::Completed { .. }) => {}
                Ok(StepOutcome::AwaitingInput { prompt }) => {
                    return Ok(RunOutcome::Paused { step_id, prompt });
                }
                Ok(StepOutcome::Failed { error }) => {
                    return self
                        .fail_workflow(workflow, step_id, error, Actor::Orchestrator, strategy)
                        .await;
                }
                Ok(StepOutcome::Discarded { reason }) => {
                    debug!(%workflow_id, step_id, %reason, "step result discarded");
                }
                Err(ExecutorError::Store(e)) if e.is_conflict() => {
                    warn!(%workflow_id, step_id, error = %e, "lost a write race, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Keep the lease; false if another owner holds it
    async fn hold_lease(
        &self,
        workflow: &mut Workflow,
        token: &str,
    ) -> Result<bool, OrchestratorError> {
        let now = Utc::now();
        let renew = match &workflow.lease {
            Some(lease) if lease.owner == token => {
                let remaining = (lease.expires_at - now).to_std().unwrap_or(Duration::ZERO);
                remaining < self.config.lease_ttl / 2
            }
            Some(lease) if !lease.is_expired(now) => return Ok(false),
            _ => true,
        };
        if !renew {
            return Ok(true);
        }

        match self
            .store
            .acquire_lease(workflow.workflow_id, token, self.config.lease_ttl)
            .await
        {
            Ok(fresh) => {
                debug!(workflow_id = %workflow.workflow_id, "lease renewed");
                *workflow = fresh;
                Ok(true)
            }
            Err(StoreError::LeaseHeld { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn complete(&self, workflow: &mut Workflow) -> Result<RunOutcome, OrchestratorError> {
        let final_response = workflow.final_response_from_results();
        workflow.final_response = Some(final_response.clone());
        let from = workflow.transition_to(WorkflowStatus::Completed)?;
        let event = WorkflowEventRecord::status_changed(
            workflow.workflow_id,
            from,
            WorkflowStatus::Completed,
            Actor::Orchestrator,
        );
        self.store.update(workflow, vec![event]).await?;

        info!(workflow_id = %workflow.workflow_id, steps = workflow.steps.len(), "workflow completed");
        Ok(RunOutcome::Completed { final_response })
    }

    /// RUNNING -> FAILED, then apply the compensation strategy
    ///
    /// The workflow stays FAILED while any compensation lacks a handler in
    /// this process, so a forced cancel elsewhere can still run it.
    async fn fail_workflow(
        &self,
        workflow: &mut Workflow,
        step_id: u32,
        error: StepError,
        actor: Actor,
        strategy: CompensationStrategy,
    ) -> Result<RunOutcome, OrchestratorError> {
        let workflow_id = workflow.workflow_id;
        workflow.error = Some(error.clone());
        let from = workflow.transition_to(WorkflowStatus::Failed)?;
        let event = WorkflowEventRecord::status_changed(workflow_id, from, WorkflowStatus::Failed, actor)
            .with_step(step_id)
            .with_details(json!({ "error": error }));
        self.store.update(workflow, vec![event]).await?;
        warn!(%workflow_id, step_id, error = %error, "workflow failed");

        let reason = format!("step {} failed: {}", step_id, error);
        let Some(report) = self.saga.apply(workflow, strategy, &reason).await? else {
            return Ok(RunOutcome::Failed { step_id, error });
        };
        if report.has_unhandled() {
            warn!(%workflow_id, unhandled = ?report.unhandled, "compensation handlers missing, leaving workflow failed");
            return Ok(RunOutcome::Failed { step_id, error });
        }

        let rollback = report.rollback_outcome();
        workflow.rollback = Some(rollback);
        let from = workflow.transition_to(WorkflowStatus::Cancelled)?;
        let event = WorkflowEventRecord::status_changed(
            workflow_id,
            from,
            WorkflowStatus::Cancelled,
            Actor::SagaManager,
        )
        .with_details(json!({
            "strategy": strategy.to_string(),
            "rollback": rollback,
            "executed": report.executed,
            "failed": report.failed,
        }));
        self.store.update(workflow, vec![event]).await?;

        info!(%workflow_id, ?rollback, "workflow rolled back");
        Ok(RunOutcome::RolledBack {
            step_id,
            error,
            report,
        })
    }
}

fn paused_outcome(workflow: &Workflow) -> RunOutcome {
    match &workflow.awaiting_input {
        Some(awaiting) => RunOutcome::Paused {
            step_id: awaiting.step_id,
            prompt: awaiting.prompt.clone(),
        },
        None => RunOutcome::Paused {
            step_id: workflow.current_step,
            prompt: String::new(),
        },
    }
}

fn lease_error(error: StoreError, workflow_id: Uuid) -> OrchestratorError {
    match error {
        StoreError::LeaseHeld { owner, .. } => OrchestratorError::Conflict { workflow_id, owner },
        other => other.into(),
    }
}
