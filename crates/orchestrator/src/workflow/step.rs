//! Steps: the planned units of work inside a workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InvalidStatusTransition, StepStatus};
use crate::handler::StepError;

/// Well-known action type names
///
/// The set is open: any key accepted by [`is_valid_key`] can be registered.
pub mod action_types {
    pub const KNOWLEDGE_RETRIEVAL: &str = "knowledge_retrieval";
    pub const DATA_QUERY: &str = "data_query";
    pub const COMPUTATION: &str = "computation";
    pub const RESPONSE_GENERATION: &str = "response_generation";
    pub const NOTIFICATION: &str = "notification";
    pub const DATA_CLEANING: &str = "data_cleaning";
}

/// Whether a string can be used as an action type or compensation type
///
/// Keys are non-empty and made of lowercase ASCII letters, digits and `_`.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Name of the handler that executes a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionType(String);

impl ActionType {
    pub fn parse(key: impl Into<String>) -> Result<Self, String> {
        let key = key.into();
        if is_valid_key(&key) {
            Ok(Self(key))
        } else {
            Err(format!("invalid action type: {:?}", key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActionType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.0
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to undo a step once it has completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Key of the registered compensation handler
    pub compensation_type: String,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Caller-supplied description of a step, before ids are assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    pub action_type: String,
    pub description: String,
    pub instruction: String,

    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Ids of earlier steps that must have completed first
    #[serde(default)]
    pub depends_on: Vec<u32>,

    #[serde(default)]
    pub compensation: Option<CompensationSpec>,

    /// Overrides the workflow-wide default
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl StepPlan {
    pub fn new(
        action_type: impl Into<String>,
        description: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
            instruction: instruction.into(),
            parameters: serde_json::Value::Null,
            depends_on: Vec::new(),
            compensation: None,
            max_retries: None,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_depends_on(mut self, depends_on: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on = depends_on.into_iter().collect();
        self
    }

    pub fn with_compensation(
        mut self,
        compensation_type: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        self.compensation = Some(CompensationSpec {
            compensation_type: compensation_type.into(),
            parameters,
        });
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One unit of planned work, owned by its workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the plan, starting at 1
    pub step_id: u32,
    pub action_type: ActionType,
    pub description: String,

    /// Passed verbatim to the handler
    pub instruction: String,

    #[serde(default)]
    pub parameters: serde_json::Value,

    #[serde(default)]
    pub depends_on: Vec<u32>,

    #[serde(default)]
    pub compensation: Option<CompensationSpec>,

    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,

    /// User reply fed in on resume, if the step asked for input
    #[serde(default)]
    pub user_response: Option<String>,

    /// Last failure, cleared on completion
    #[serde(default)]
    pub error: Option<StepError>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub(crate) fn from_plan(
        step_id: u32,
        action_type: ActionType,
        plan: StepPlan,
        default_max_retries: u32,
    ) -> Self {
        Self {
            step_id,
            action_type,
            description: plan.description,
            instruction: plan.instruction,
            parameters: plan.parameters,
            depends_on: plan.depends_on,
            compensation: plan.compensation,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: plan.max_retries.unwrap_or(default_max_retries),
            user_response: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move the step to a new status, stamping start and completion times
    pub(crate) fn transition_to(
        &mut self,
        to: StepStatus,
    ) -> Result<StepStatus, InvalidStatusTransition> {
        let from = self.status;
        from.check_transition(to)?;

        match to {
            StepStatus::Executing => {
                self.started_at.get_or_insert_with(Utc::now);
            }
            StepStatus::Completed | StepStatus::Failed => {
                self.completed_at = Some(Utc::now());
            }
            StepStatus::Pending | StepStatus::Dispatched => {}
        }

        self.status = to;
        Ok(from)
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Failed, but the last error allows another attempt
    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed
            && self.has_retries_left()
            && self.error.as_ref().map_or(true, |e| e.retryable)
    }

    /// Attempts allowed in total: the initial one plus retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn compensation_type(&self) -> Option<&str> {
        self.compensation
            .as_ref()
            .map(|c| c.compensation_type.as_str())
    }
}
