//! Status enums and their transition tables
//!
//! Every transition check is an exhaustive `match` so that adding a status
//! forces each table to be revisited.

use serde::{Deserialize, Serialize};

/// A requested status change that the state machine does not allow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity} status transition: {from} -> {to}")]
pub struct InvalidStatusTransition {
    /// What kind of entity was being transitioned ("workflow", "step", ...)
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl InvalidStatusTransition {
    pub fn new(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created with a full step plan, not started
    Pending,

    /// An orchestration loop is advancing the workflow
    Running,

    /// Waiting for external input (e.g. a user reply)
    Paused,

    /// All steps completed
    Completed,

    /// A step exhausted its retries or timed out
    Failed,

    /// Cancelled by a user or after rollback
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Cancelled) => true,
            (Failed, Cancelled) => true,
            (Pending, _) | (Running, _) | (Paused, _) | (Failed, _) => false,
            (Completed, _) | (Cancelled, _) => false,
        }
    }

    /// Validate a transition, returning the error used across the crate
    pub fn check_transition(self, to: WorkflowStatus) -> Result<(), InvalidStatusTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidStatusTransition::new("workflow", self, to))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow status: {}", other)),
        }
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Dispatched,
    Executing,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        use StepStatus::*;

        match (self, to) {
            (Pending, Dispatched) => true,
            // Fails before the handler runs: no handler, precondition
            (Pending, Failed) | (Dispatched, Failed) => true,
            (Dispatched, Executing) => true,
            // Crash recovery of a dispatched step
            (Dispatched, Pending) => true,
            (Executing, Completed) | (Executing, Failed) => true,
            // Suspended awaiting input, or reset during recovery
            (Executing, Pending) => true,
            // Retry
            (Failed, Executing) => true,
            (Pending, _) | (Dispatched, _) | (Executing, _) | (Failed, _) => false,
            (Completed, _) => false,
        }
    }

    pub fn check_transition(self, to: StepStatus) -> Result<(), InvalidStatusTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidStatusTransition::new("step", self, to))
        }
    }

    /// Dispatched or executing: a handler may be running right now
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a planned compensation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    /// Claimed by a saga sweep; the handler may be running
    Executing,
    Executed,
    Failed,
}

impl CompensationStatus {
    pub fn can_transition_to(self, to: CompensationStatus) -> bool {
        use CompensationStatus::*;

        match (self, to) {
            (Pending, Executing) | (Pending, Executed) | (Pending, Failed) => true,
            (Executing, Executed) | (Executing, Failed) => true,
            (Pending, _) | (Executing, _) => false,
            (Executed, _) | (Failed, _) => false,
        }
    }

    pub fn check_transition(self, to: CompensationStatus) -> Result<(), InvalidStatusTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidStatusTransition::new("compensation", self, to))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cancelled workflow's completed work was rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// Every pending compensation executed
    FullyCompensated,

    /// At least one compensation failed and needs manual remediation
    PartiallyCompensated,

    /// Cancelled without compensating; partial completion accepted as final
    NotCompensated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ];

        for from in [WorkflowStatus::Completed, WorkflowStatus::Cancelled] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_workflow_transitions() {
        assert!(WorkflowStatus::Pending.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Paused));
        assert!(WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Failed));
        assert!(WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Cancelled));

        assert!(!WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Running));
        assert!(!WorkflowStatus::Pending.can_transition_to(WorkflowStatus::Completed));
        assert!(!WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Completed));
    }

    #[test]
    fn test_check_transition_error() {
        let err = WorkflowStatus::Completed
            .check_transition(WorkflowStatus::Running)
            .unwrap_err();
        assert_eq!(err.entity, "workflow");
        assert_eq!(err.to_string(), "invalid workflow status transition: completed -> running");
    }

    #[test]
    fn test_step_retry_loop() {
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Failed));
        assert!(StepStatus::Failed.can_transition_to(StepStatus::Executing));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Executing));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Executing));
    }

    #[test]
    fn test_compensation_is_one_shot() {
        assert!(CompensationStatus::Pending.can_transition_to(CompensationStatus::Executed));
        assert!(!CompensationStatus::Executed.can_transition_to(CompensationStatus::Failed));
        assert!(!CompensationStatus::Failed.can_transition_to(CompensationStatus::Executed));
        assert!(CompensationStatus::Pending.can_transition_to(CompensationStatus::Executing));
        assert!(CompensationStatus::Executing.can_transition_to(CompensationStatus::Failed));
        assert!(!CompensationStatus::Executing.can_transition_to(CompensationStatus::Pending));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Paused,
            WorkflowStatus::Cancelled,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }
}
