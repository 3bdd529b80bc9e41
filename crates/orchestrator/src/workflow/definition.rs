//! The workflow document: aggregate root for one orchestrated task

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ActionType, CompensationAction, CompensationRecord, InvalidStatusTransition, RollbackOutcome,
    Step, StepPlan, StepStatus, WorkflowStatus, is_valid_key,
};
use crate::handler::StepError;

/// Results of completed steps keyed by step id
pub type StepResults = BTreeMap<u32, serde_json::Value>;

/// Default task type tag when the caller does not set one
pub const DEFAULT_TASK_TYPE: &str = "general";

/// Reasons a step plan is rejected at creation time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("workflow plan has no steps")]
    EmptyPlan,

    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("step {step_id}: invalid action type {action_type:?}")]
    InvalidActionType { step_id: u32, action_type: String },

    #[error("step {step_id}: invalid compensation type {compensation_type:?}")]
    InvalidCompensationType {
        step_id: u32,
        compensation_type: String,
    },

    #[error("step {step_id}: dependency {depends_on} is not an earlier step")]
    InvalidDependency { step_id: u32, depends_on: u32 },
}

/// Errors raised when mutating a workflow document in memory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("step not found: {0}")]
    StepNotFound(u32),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidStatusTransition),
}

/// Time-bounded ownership claim on a workflow document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            owner: owner.into(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Held by `owner` and not yet expired
    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && !self.is_expired(now)
    }
}

/// A step waiting for a user reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingInput {
    pub step_id: u32,
    pub prompt: String,
}

/// The persisted workflow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,

    /// Groups workflows belonging to one user conversation
    pub session_id: String,

    #[serde(default)]
    pub user_id: Option<String>,

    pub instruction: String,
    pub task_type: String,
    pub status: WorkflowStatus,

    /// Id of the next step to run; `steps.len() + 1` once all completed
    pub current_step: u32,

    /// Step ids in completion order
    pub completed_steps: Vec<u32>,

    /// Step ids whose status is currently failed
    pub failed_steps: Vec<u32>,

    pub results: StepResults,

    #[serde(default)]
    pub final_response: Option<String>,

    /// Fixed at creation
    pub steps: Vec<Step>,

    pub compensations: Vec<CompensationAction>,
    pub compensation_history: Vec<CompensationRecord>,

    #[serde(default)]
    pub awaiting_input: Option<AwaitingInput>,

    /// Failure that moved the workflow to FAILED
    #[serde(default)]
    pub error: Option<StepError>,

    /// Set when the workflow reaches CANCELLED
    #[serde(default)]
    pub rollback: Option<RollbackOutcome>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Compare-and-swap stamp, bumped by every successful store update
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub lease: Option<Lease>,
}

impl Workflow {
    pub fn builder(session_id: impl Into<String>, instruction: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(session_id, instruction)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: u32) -> Option<&Step> {
        step_index(step_id).and_then(|i| self.steps.get(i))
    }

    pub fn step_mut(&mut self, step_id: u32) -> Option<&mut Step> {
        step_index(step_id).and_then(move |i| self.steps.get_mut(i))
    }

    /// The step at the current pointer, if any remain
    pub fn current(&self) -> Option<&Step> {
        self.step(self.current_step)
    }

    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Move the workflow to a new status, returning the previous one
    pub fn transition_to(
        &mut self,
        to: WorkflowStatus,
    ) -> Result<WorkflowStatus, InvalidStatusTransition> {
        let from = self.status;
        from.check_transition(to)?;
        self.status = to;
        Ok(from)
    }

    /// Move a step to a new status and keep the completed/failed sets in sync
    pub fn set_step_status(
        &mut self,
        step_id: u32,
        to: StepStatus,
    ) -> Result<StepStatus, WorkflowError> {
        let step = self
            .step_mut(step_id)
            .ok_or(WorkflowError::StepNotFound(step_id))?;
        let from = step.transition_to(to)?;

        self.failed_steps.retain(|id| *id != step_id);
        match to {
            StepStatus::Failed => self.failed_steps.push(step_id),
            StepStatus::Completed => {
                if !self.completed_steps.contains(&step_id) {
                    self.completed_steps.push(step_id);
                }
            }
            StepStatus::Pending | StepStatus::Dispatched | StepStatus::Executing => {}
        }

        Ok(from)
    }

    /// Store a step's result and advance the pointer past it
    pub fn record_step_completed(
        &mut self,
        step_id: u32,
        result: serde_json::Value,
    ) -> Result<(), WorkflowError> {
        self.set_step_status(step_id, StepStatus::Completed)?;
        if let Some(step) = self.step_mut(step_id) {
            step.error = None;
        }
        self.results.insert(step_id, result);
        self.current_step = self.current_step.max(step_id + 1);

        // Compensations are planned up front; this covers documents
        // created before the step declared one.
        let needs_plan = self.step(step_id).and_then(CompensationAction::for_step);
        if let Some(action) = needs_plan {
            if self.compensation_for_step(step_id).is_none() {
                self.compensations.push(action);
            }
        }
        Ok(())
    }

    pub fn record_step_failed(&mut self, step_id: u32, error: StepError) -> Result<(), WorkflowError> {
        self.set_step_status(step_id, StepStatus::Failed)?;
        if let Some(step) = self.step_mut(step_id) {
            step.error = Some(error);
        }
        Ok(())
    }

    pub fn compensation_for_step(&self, step_id: u32) -> Option<&CompensationAction> {
        self.compensations.iter().find(|c| c.step_id == step_id)
    }

    pub fn compensation_for_step_mut(&mut self, step_id: u32) -> Option<&mut CompensationAction> {
        self.compensations.iter_mut().find(|c| c.step_id == step_id)
    }

    /// Results visible to a step: everything completed so far
    pub fn previous_results(&self) -> &StepResults {
        &self.results
    }

    /// Final response built from the last step's result
    ///
    /// A string result is used as-is; an object with a string `response`
    /// field contributes that field; anything else is rendered as JSON.
    pub fn final_response_from_results(&self) -> String {
        let Some((_, last)) = self.results.iter().next_back() else {
            return String::new();
        };

        match last {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => match map.get("response") {
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => last.to_string(),
            },
            other => other.to_string(),
        }
    }

    /// Most recent sign of life: the heartbeat, or the last update
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.updated_at)
    }

    /// How long the workflow has been silent
    pub fn silence(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_seen())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Check the data-model invariants
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let step_count = self.steps.len() as u32;

        for (index, step) in self.steps.iter().enumerate() {
            if step.step_id != index as u32 + 1 {
                return Err(format!(
                    "step at position {} has id {}",
                    index + 1,
                    step.step_id
                ));
            }
        }

        let completed: HashSet<u32> = self.completed_steps.iter().copied().collect();
        let failed: HashSet<u32> = self.failed_steps.iter().copied().collect();

        if completed.len() != self.completed_steps.len() {
            return Err("completed_steps contains duplicates".to_string());
        }
        if failed.len() != self.failed_steps.len() {
            return Err("failed_steps contains duplicates".to_string());
        }
        if let Some(id) = completed.intersection(&failed).next() {
            return Err(format!("step {} is both completed and failed", id));
        }
        if let Some(id) = completed
            .iter()
            .chain(failed.iter())
            .find(|id| **id == 0 || **id > step_count)
        {
            return Err(format!("step id {} outside 1..={}", id, step_count));
        }

        for id in &self.completed_steps {
            if self.step(*id).map(|s| s.status) != Some(StepStatus::Completed) {
                return Err(format!("step {} listed as completed but is not", id));
            }
        }
        for id in &self.failed_steps {
            if self.step(*id).map(|s| s.status) != Some(StepStatus::Failed) {
                return Err(format!("step {} listed as failed but is not", id));
            }
        }

        if self.current_step == 0 || self.current_step > step_count + 1 {
            return Err(format!(
                "current_step {} outside 1..={}",
                self.current_step,
                step_count + 1
            ));
        }

        if let Some(record) = self
            .compensation_history
            .iter()
            .find(|r| !completed.contains(&r.step_id))
        {
            return Err(format!(
                "step {} compensated without having completed",
                record.step_id
            ));
        }

        Ok(())
    }
}

fn step_index(step_id: u32) -> Option<usize> {
    (step_id as usize).checked_sub(1)
}

/// Builder validating a step plan into a new PENDING workflow
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    session_id: String,
    instruction: String,
    task_type: String,
    user_id: Option<String>,
    default_max_retries: u32,
    steps: Vec<StepPlan>,
}

impl WorkflowBuilder {
    pub fn new(session_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            instruction: instruction.into(),
            task_type: DEFAULT_TASK_TYPE.to_string(),
            user_id: None,
            default_max_retries: 3,
            steps: Vec::new(),
        }
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Retry limit for steps that do not set their own
    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn step(mut self, plan: StepPlan) -> Self {
        self.steps.push(plan);
        self
    }

    pub fn steps(mut self, plans: impl IntoIterator<Item = StepPlan>) -> Self {
        self.steps.extend(plans);
        self
    }

    /// Assign step ids 1..n, validate the plan and plan compensations
    pub fn build(self) -> Result<Workflow, PlanError> {
        if self.session_id.trim().is_empty() {
            return Err(PlanError::EmptySessionId);
        }
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, plan) in self.steps.into_iter().enumerate() {
            let step_id = index as u32 + 1;

            let action_type = ActionType::parse(plan.action_type.clone()).map_err(|_| {
                PlanError::InvalidActionType {
                    step_id,
                    action_type: plan.action_type.clone(),
                }
            })?;

            if let Some(spec) = &plan.compensation {
                if !is_valid_key(&spec.compensation_type) {
                    return Err(PlanError::InvalidCompensationType {
                        step_id,
                        compensation_type: spec.compensation_type.clone(),
                    });
                }
            }

            if let Some(dep) = plan.depends_on.iter().find(|d| **d == 0 || **d >= step_id) {
                return Err(PlanError::InvalidDependency {
                    step_id,
                    depends_on: *dep,
                });
            }

            steps.push(Step::from_plan(
                step_id,
                action_type,
                plan,
                self.default_max_retries,
            ));
        }

        let compensations = steps.iter().filter_map(CompensationAction::for_step).collect();
        let now = Utc::now();

        Ok(Workflow {
            workflow_id: Uuid::now_v7(),
            session_id: self.session_id,
            user_id: self.user_id,
            instruction: self.instruction,
            task_type: self.task_type,
            status: WorkflowStatus::Pending,
            current_step: 1,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            results: StepResults::new(),
            final_response: None,
            steps,
            compensations,
            compensation_history: Vec::new(),
            awaiting_input: None,
            error: None,
            rollback: None,
            created_at: now,
            updated_at: now,
            last_heartbeat: None,
            version: 0,
            lease: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::action_types;
    use serde_json::json;

    fn three_step_workflow() -> Workflow {
        Workflow::builder("session-1", "Summarise last quarter's sales")
            .task_type("analysis")
            .step(StepPlan::new(action_types::KNOWLEDGE_RETRIEVAL, "Find docs", "sales docs"))
            .step(
                StepPlan::new(action_types::DATA_QUERY, "Query", "SELECT ...")
                    .with_compensation("drop_temp_table", json!({"table": "tmp_sales"})),
            )
            .step(
                StepPlan::new(action_types::RESPONSE_GENERATION, "Answer", "summarise")
                    .with_depends_on([1, 2]),
            )
            .build()
            .unwrap()
    }

    fn complete(workflow: &mut Workflow, step_id: u32, result: serde_json::Value) {
        workflow.set_step_status(step_id, StepStatus::Dispatched).unwrap();
        workflow.set_step_status(step_id, StepStatus::Executing).unwrap();
        workflow.record_step_completed(step_id, result).unwrap();
    }

    #[test]
    fn test_build_assigns_ids_and_plans_compensations() {
        let workflow = three_step_workflow();

        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert_eq!(workflow.current_step, 1);
        let ids: Vec<u32> = workflow.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(workflow.compensations.len(), 1);
        assert_eq!(workflow.compensations[0].step_id, 2);
        assert_eq!(workflow.steps[0].max_retries, 3);
        assert!(workflow.check_invariants().is_ok());
    }

    #[test]
    fn test_build_rejects_bad_plans() {
        let err = Workflow::builder("s", "i").build().unwrap_err();
        assert_eq!(err, PlanError::EmptyPlan);

        let err = Workflow::builder("", "i")
            .step(StepPlan::new("computation", "d", "i"))
            .build()
            .unwrap_err();
        assert_eq!(err, PlanError::EmptySessionId);

        let err = Workflow::builder("s", "i")
            .step(StepPlan::new("Computation!", "d", "i"))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidActionType { step_id: 1, .. }));

        let err = Workflow::builder("s", "i")
            .step(StepPlan::new("computation", "d", "i").with_depends_on([1]))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            PlanError::InvalidDependency {
                step_id: 1,
                depends_on: 1
            }
        );

        let err = Workflow::builder("s", "i")
            .step(StepPlan::new("computation", "d", "i").with_compensation("", json!({})))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidCompensationType { .. }));
    }

    #[test]
    fn test_completion_advances_pointer_and_keeps_sets_disjoint() {
        let mut workflow = three_step_workflow();

        complete(&mut workflow, 1, json!({"docs": 2}));
        assert_eq!(workflow.current_step, 2);
        assert_eq!(workflow.completed_steps, vec![1]);

        workflow.set_step_status(2, StepStatus::Dispatched).unwrap();
        workflow.set_step_status(2, StepStatus::Executing).unwrap();
        workflow
            .record_step_failed(2, StepError::retryable("timeout"))
            .unwrap();
        assert_eq!(workflow.failed_steps, vec![2]);
        assert!(workflow.check_invariants().is_ok());

        // Retry clears the failed marker
        workflow.set_step_status(2, StepStatus::Executing).unwrap();
        assert!(workflow.failed_steps.is_empty());
        workflow.record_step_completed(2, json!(42)).unwrap();

        assert_eq!(workflow.completed_steps, vec![1, 2]);
        assert!(workflow.failed_steps.is_empty());
        assert!(workflow.step(2).unwrap().error.is_none());
        assert!(workflow.check_invariants().is_ok());
    }

    #[test]
    fn test_unknown_step() {
        let mut workflow = three_step_workflow();
        assert!(workflow.step(0).is_none());
        assert_eq!(
            workflow.set_step_status(9, StepStatus::Dispatched),
            Err(WorkflowError::StepNotFound(9))
        );
    }

    #[test]
    fn test_invariant_violations_detected() {
        let mut workflow = three_step_workflow();
        workflow.completed_steps.push(2);
        assert!(workflow.check_invariants().is_err());

        let mut workflow = three_step_workflow();
        workflow.failed_steps.push(7);
        assert!(workflow.check_invariants().is_err());

        let mut workflow = three_step_workflow();
        workflow.current_step = 5;
        assert!(workflow.check_invariants().is_err());
    }

    #[test]
    fn test_final_response_from_results() {
        let mut workflow = three_step_workflow();
        assert_eq!(workflow.final_response_from_results(), "");

        complete(&mut workflow, 1, json!({"docs": 2}));
        complete(&mut workflow, 2, json!(42));
        complete(&mut workflow, 3, json!({"response": "Sales grew 4%"}));
        assert_eq!(workflow.final_response_from_results(), "Sales grew 4%");
        assert!(workflow.all_steps_completed());
        assert!(workflow.current().is_none());
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new("worker-a", Duration::from_secs(60));
        let now = Utc::now();
        assert!(lease.is_held_by("worker-a", now));
        assert!(!lease.is_held_by("worker-b", now));
        assert!(lease.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_document_round_trips_through_json() {
        let workflow = three_step_workflow();
        let json = serde_json::to_value(&workflow).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["steps"][1]["action_type"], "data_query");

        let parsed: Workflow = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, workflow);
    }
}
