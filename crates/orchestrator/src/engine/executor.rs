//! Step executor
//!
//! The `StepExecutor` is responsible for:
//! - Mapping a step's action type to its registered handler
//! - Checking preconditions before dispatch
//! - Invoking the handler with the heartbeat active
//! - Retrying failures with exponential backoff
//! - Persisting every step transition before returning

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::job::StepJob;
use super::registry::{HandlerRegistry, RegistryError};
use crate::handler::{
    ExecutionResult, FnStepHandler, StepContext, StepError, StepHandler, StepInvocation,
};
use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::{HeartbeatTracker, RetryPolicy};
use crate::workflow::{
    Actor, AwaitingInput, EventType, InvalidStatusTransition, Step, StepStatus, Workflow,
    WorkflowError, WorkflowEventRecord, WorkflowStatus,
};

/// Configuration for the step executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often the heartbeat is refreshed while a step runs
    pub heartbeat_interval: Duration,

    /// Backoff between retries
    pub retry_policy: RetryPolicy,

    /// Optional hard limit on a single handler call
    pub step_deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            retry_policy: RetryPolicy::exponential(),
            step_deadline: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_step_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.step_deadline = deadline;
        self
    }
}

/// Errors from executor operations
///
/// Step failures are not errors: they come back as [`StepOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error (including lost compare-and-swap races)
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Transition(#[from] InvalidStatusTransition),

    #[error("workflow {workflow_id} is {status}, expected running")]
    NotRunning {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("step {step_id} of workflow {workflow_id} is {status} and cannot run")]
    StepNotRunnable {
        workflow_id: Uuid,
        step_id: u32,
        status: StepStatus,
    },
}

/// What happened to a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step completed; the result is stored in the workflow
    Completed { result: serde_json::Value },

    /// Step failed for good (retries exhausted or non-retryable)
    Failed { error: StepError },

    /// Step suspended; the workflow is now PAUSED
    AwaitingInput { prompt: String },

    /// The handler finished after the workflow moved on; nothing recorded
    Discarded { reason: String },
}

/// Executes single steps against registered handlers
///
/// # Example
///
/// ```ignore
/// let executor = StepExecutor::new(store.clone(), heartbeats, ExecutorConfig::default());
/// executor.register_fn("data_query", |inv: StepInvocation| async move {
///     ExecutionResult::success(json!({ "rows": 3 }))
/// })?;
///
/// let outcome = executor.execute_step(&mut workflow, 1).await?;
/// ```
pub struct StepExecutor {
    store: Arc<dyn WorkflowStore>,
    heartbeats: Arc<HeartbeatTracker>,
    handlers: HandlerRegistry<dyn StepHandler>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        heartbeats: Arc<HeartbeatTracker>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            heartbeats,
            handlers: HandlerRegistry::new("action type"),
            config,
        }
    }

    /// Register the handler for an action type (last write wins)
    pub fn register_handler(
        &self,
        action_type: &str,
        handler: Arc<dyn StepHandler>,
    ) -> Result<bool, RegistryError> {
        self.handlers.register(action_type, handler)
    }

    /// Register an async closure as the handler for an action type
    pub fn register_fn<F, Fut>(&self, action_type: &str, func: F) -> Result<bool, RegistryError>
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        self.register_handler(action_type, Arc::new(FnStepHandler::new(func)))
    }

    pub fn handler(&self, action_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(action_type)
    }

    pub fn handlers(&self) -> &HandlerRegistry<dyn StepHandler> {
        &self.handlers
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatTracker> {
        &self.heartbeats
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one step to an outcome
    ///
    /// The step must be PENDING, DISPATCHED, or FAILED with a retry left.
    /// `workflow` is kept in sync with the store: every transition is
    /// persisted (bumping `version`) before this returns.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    pub async fn execute_step(
        &self,
        workflow: &mut Workflow,
        step_id: u32,
    ) -> Result<StepOutcome, ExecutorError> {
        let workflow_id = workflow.workflow_id;
        if workflow.status != WorkflowStatus::Running {
            return Err(ExecutorError::NotRunning {
                workflow_id,
                status: workflow.status,
            });
        }

        let step = workflow
            .step(step_id)
            .ok_or(WorkflowError::StepNotFound(step_id))?;
        let runnable =
            matches!(step.status, StepStatus::Pending | StepStatus::Dispatched) || step.can_retry();
        if !runnable {
            return Err(ExecutorError::StepNotRunnable {
                workflow_id,
                step_id,
                status: step.status,
            });
        }

        let action_type = step.action_type.clone();
        let Some(handler) = self.handlers.get(action_type.as_str()) else {
            warn!(%workflow_id, step_id, %action_type, "no handler registered");
            let error = StepError::no_handler(action_type.as_str());
            return self.fail_before_execution(workflow, step_id, error).await;
        };

        if let Err(reason) = check_preconditions(workflow, step, handler.as_ref()) {
            warn!(%workflow_id, step_id, %reason, "precondition failed");
            let error = StepError::precondition_failed(reason);
            return self.fail_before_execution(workflow, step_id, error).await;
        }

        if step.status == StepStatus::Pending {
            let job = StepJob::from_step(workflow_id, step);
            workflow.set_step_status(step_id, StepStatus::Dispatched)?;
            let event = WorkflowEventRecord::step_changed(
                workflow_id,
                step_id,
                StepStatus::Pending,
                StepStatus::Dispatched,
                Actor::StepExecutor,
            )
            .with_details(json!({ "job": job }));
            self.store.update(workflow, vec![event]).await?;
            debug!(%workflow_id, step_id, %action_type, "step dispatched");
        }

        loop {
            let from = workflow.set_step_status(step_id, StepStatus::Executing)?;
            // Counts as the first heartbeat of this attempt
            workflow.last_heartbeat = Some(Utc::now());
            let attempt = retry_count(workflow, step_id) + 1;
            let event = WorkflowEventRecord::step_changed(
                workflow_id,
                step_id,
                from,
                StepStatus::Executing,
                Actor::StepExecutor,
            )
            .with_details(json!({ "attempt": attempt }));
            self.store.update(workflow, vec![event]).await?;

            let result = {
                let _heartbeat = self.heartbeats.start_guarded(
                    workflow_id,
                    step_id,
                    self.config.heartbeat_interval,
                );
                self.invoke(handler.as_ref(), workflow, step_id).await
            };

            if let Some(reason) = self.discard_if_superseded(workflow, step_id).await? {
                return Ok(StepOutcome::Discarded { reason });
            }

            match result {
                ExecutionResult::Success { result } => {
                    workflow.record_step_completed(step_id, result.clone())?;
                    let event = WorkflowEventRecord::step_changed(
                        workflow_id,
                        step_id,
                        StepStatus::Executing,
                        StepStatus::Completed,
                        Actor::StepExecutor,
                    );
                    self.store.update(workflow, vec![event]).await?;

                    info!(%workflow_id, step_id, attempt, "step completed");
                    return Ok(StepOutcome::Completed { result });
                }

                ExecutionResult::AwaitingInput { prompt } => {
                    workflow.set_step_status(step_id, StepStatus::Pending)?;
                    workflow.awaiting_input = Some(AwaitingInput {
                        step_id,
                        prompt: prompt.clone(),
                    });
                    let from = workflow.transition_to(WorkflowStatus::Paused)?;
                    let events = vec![
                        WorkflowEventRecord::step_changed(
                            workflow_id,
                            step_id,
                            StepStatus::Executing,
                            StepStatus::Pending,
                            Actor::StepExecutor,
                        )
                        .with_details(json!({ "awaiting_input": prompt })),
                        WorkflowEventRecord::status_changed(
                            workflow_id,
                            from,
                            WorkflowStatus::Paused,
                            Actor::StepExecutor,
                        ),
                    ];
                    self.store.update(workflow, events).await?;

                    info!(%workflow_id, step_id, "step awaiting user input");
                    return Ok(StepOutcome::AwaitingInput { prompt });
                }

                ExecutionResult::Failure { error } => {
                    workflow.record_step_failed(step_id, error.clone())?;
                    let mut events = vec![WorkflowEventRecord::step_changed(
                        workflow_id,
                        step_id,
                        StepStatus::Executing,
                        StepStatus::Failed,
                        Actor::StepExecutor,
                    )
                    .with_details(json!({ "attempt": attempt, "error": error }))];

                    let step = workflow
                        .step_mut(step_id)
                        .ok_or(WorkflowError::StepNotFound(step_id))?;
                    if error.retryable && step.has_retries_left() {
                        step.retry_count += 1;
                        let retry = step.retry_count;
                        let max_retries = step.max_retries;
                        let delay = self.config.retry_policy.delay_for_retry(retry);

                        events.push(
                            WorkflowEventRecord::new(
                                workflow_id,
                                EventType::StepRetryScheduled,
                                Actor::StepExecutor,
                            )
                            .with_step(step_id)
                            .with_details(json!({
                                "retry": retry,
                                "max_retries": max_retries,
                                "delay_ms": delay.as_millis() as u64,
                            })),
                        );
                        self.store.update(workflow, events).await?;

                        warn!(
                            %workflow_id,
                            step_id,
                            retry,
                            max_retries,
                            ?delay,
                            error = %error,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    self.store.update(workflow, events).await?;
                    warn!(%workflow_id, step_id, attempt, error = %error, "step failed");
                    return Ok(StepOutcome::Failed { error });
                }
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn StepHandler,
        workflow: &Workflow,
        step_id: u32,
    ) -> ExecutionResult {
        let Some(step) = workflow.step(step_id) else {
            return ExecutionResult::failure(StepError::non_retryable(format!(
                "step {} vanished from workflow",
                step_id
            )));
        };

        let ctx = StepContext::new(
            workflow.workflow_id,
            &workflow.session_id,
            step_id,
            step.retry_count + 1,
            step.max_attempts(),
        )
        .with_user_response(step.user_response.clone());

        let call = handler.execute(&ctx, step, workflow.previous_results());
        match self.config.step_deadline {
            Some(deadline) => match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => ExecutionResult::failure(StepError::timeout(format!(
                    "step exceeded deadline of {:?}",
                    deadline
                ))),
            },
            None => call.await,
        }
    }

    /// Re-read the document after the handler returns
    ///
    /// If the workflow was changed by someone else, the result is dropped
    /// and `workflow` is replaced with the stored copy.
    async fn discard_if_superseded(
        &self,
        workflow: &mut Workflow,
        step_id: u32,
    ) -> Result<Option<String>, ExecutorError> {
        let current = self.store.get(workflow.workflow_id).await?;

        let reason = if current.version != workflow.version {
            Some(format!(
                "workflow version moved from {} to {}",
                workflow.version, current.version
            ))
        } else if current.status != WorkflowStatus::Running {
            Some(format!("workflow is {}", current.status))
        } else if current.step(step_id).map(|s| s.status) != Some(StepStatus::Executing) {
            Some(format!("step {} is no longer executing", step_id))
        } else {
            None
        };

        if let Some(reason) = &reason {
            warn!(workflow_id = %workflow.workflow_id, step_id, %reason, "discarding late step result");
            let event = WorkflowEventRecord::new(
                workflow.workflow_id,
                EventType::StepResultDiscarded,
                Actor::StepExecutor,
            )
            .with_step(step_id)
            .with_details(json!({ "reason": reason }));
            self.store.append_event(event).await?;
            *workflow = current;
        }

        Ok(reason)
    }

    /// Fail a step before its handler runs (never retried)
    async fn fail_before_execution(
        &self,
        workflow: &mut Workflow,
        step_id: u32,
        error: StepError,
    ) -> Result<StepOutcome, ExecutorError> {
        let step = workflow
            .step_mut(step_id)
            .ok_or(WorkflowError::StepNotFound(step_id))?;
        let from = step.status;

        if from == StepStatus::Failed {
            step.error = Some(error.clone());
        } else {
            workflow.record_step_failed(step_id, error.clone())?;
        }

        let event = WorkflowEventRecord::step_changed(
            workflow.workflow_id,
            step_id,
            from,
            StepStatus::Failed,
            Actor::StepExecutor,
        )
        .with_details(json!({ "error": error }));
        self.store.update(workflow, vec![event]).await?;

        Ok(StepOutcome::Failed { error })
    }
}

/// Declared dependencies first, then the handler's own check
fn check_preconditions(
    workflow: &Workflow,
    step: &Step,
    handler: &dyn StepHandler,
) -> Result<(), String> {
    if let Some(missing) = step
        .depends_on
        .iter()
        .find(|dep| !workflow.completed_steps.contains(dep))
    {
        return Err(format!(
            "step {} depends on step {} which has not completed",
            step.step_id, missing
        ));
    }
    handler.check_precondition(step, workflow.previous_results())
}

fn retry_count(workflow: &Workflow, step_id: u32) -> u32 {
    workflow.step(step_id).map_or(0, |s| s.retry_count)
}
