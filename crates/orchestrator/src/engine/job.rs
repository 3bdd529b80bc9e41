//! Job contract exchanged with a task-queue substrate

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Step;

/// One step dispatch, as a queue would carry it
///
/// Built when a step moves to DISPATCHED and recorded in the dispatch
/// audit event. Delivery is at-least-once, so handlers must be idempotent
/// or compensable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJob {
    pub workflow_id: Uuid,
    pub step_id: u32,
    pub action_type: String,
    pub instruction: String,

    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Compensation type to run if the step must be undone
    #[serde(default)]
    pub compensation_key: Option<String>,

    pub retry_count: u32,

    /// Bounded retry count the substrate should honour
    pub max_retries: u32,
}

impl StepJob {
    pub fn from_step(workflow_id: Uuid, step: &Step) -> Self {
        Self {
            workflow_id,
            step_id: step.step_id,
            action_type: step.action_type.to_string(),
            instruction: step.instruction.clone(),
            parameters: step.parameters.clone(),
            compensation_key: step.compensation_type().map(str::to_string),
            retry_count: step.retry_count,
            max_retries: step.max_retries,
        }
    }
}
