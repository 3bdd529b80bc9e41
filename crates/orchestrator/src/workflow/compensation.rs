//! Planned compensations and the history of executed ones

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActionType, CompensationStatus, InvalidStatusTransition, Step};

/// Undo operation tied 1:1 to a step that declares a compensation type
///
/// Planned together with the step plan and consumed once by the saga
/// manager; a non-pending action is never executed again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationAction {
    pub action_id: Uuid,
    pub step_id: u32,

    /// Action type of the step being undone
    pub action_type: ActionType,

    /// Key of the registered compensation handler
    pub compensation_type: String,

    #[serde(default)]
    pub parameters: serde_json::Value,

    pub status: CompensationStatus,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

impl CompensationAction {
    /// Plan the compensation for a step, if it declares one
    pub fn for_step(step: &Step) -> Option<Self> {
        let spec = step.compensation.as_ref()?;
        Some(Self {
            action_id: Uuid::now_v7(),
            step_id: step.step_id,
            action_type: step.action_type.clone(),
            compensation_type: spec.compensation_type.clone(),
            parameters: spec.parameters.clone(),
            status: CompensationStatus::Pending,
            error: None,
            executed_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == CompensationStatus::Pending
    }

    /// Claimed by a sweep whose outcome was never recorded
    pub fn is_executing(&self) -> bool {
        self.status == CompensationStatus::Executing
    }

    /// Mark the action as taken before its handler is called
    pub(crate) fn claim(&mut self) -> Result<(), InvalidStatusTransition> {
        self.status.check_transition(CompensationStatus::Executing)?;
        self.status = CompensationStatus::Executing;
        Ok(())
    }

    /// Record the outcome of the single allowed execution
    pub(crate) fn finish(
        &mut self,
        status: CompensationStatus,
        error: Option<String>,
    ) -> Result<(), InvalidStatusTransition> {
        self.status.check_transition(status)?;
        self.status = status;
        self.error = error;
        self.executed_at = Some(Utc::now());
        Ok(())
    }
}

/// Entry in a workflow's compensation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub action_id: Uuid,
    pub step_id: u32,
    pub compensation_type: String,
    pub status: CompensationStatus,

    #[serde(default)]
    pub error: Option<String>,

    /// Value returned by the compensation handler
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    pub executed_at: DateTime<Utc>,
}

impl CompensationRecord {
    pub fn from_action(action: &CompensationAction, result: Option<serde_json::Value>) -> Self {
        Self {
            action_id: action.action_id,
            step_id: action.step_id,
            compensation_type: action.compensation_type.clone(),
            status: action.status,
            error: action.error.clone(),
            result,
            executed_at: action.executed_at.unwrap_or_else(Utc::now),
        }
    }
}
