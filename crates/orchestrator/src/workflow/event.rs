//! Audit events for workflow state changes
//!
//! Events are append-only and never read back by the orchestration core.
//! They exist for observability: every state-changing store operation
//! appends one record per transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of state change an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    WorkflowCreated,
    WorkflowStatusChanged,
    WorkflowDeleted,

    // =========================================================================
    // Step Events
    // =========================================================================
    StepStatusChanged,
    StepRetryScheduled,
    /// A handler result arrived after the step stopped being the executing one
    StepResultDiscarded,
    /// The step's heartbeat went stale
    HeartbeatTimedOut,
    UserInputReceived,

    // =========================================================================
    // Compensation Events
    // =========================================================================
    /// A saga sweep took the action and is about to call its handler
    CompensationStarted,
    CompensationExecuted,
    CompensationFailed,

    // =========================================================================
    // Lease Events
    // =========================================================================
    LeaseAcquired,
    LeaseReleased,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow_created",
            Self::WorkflowStatusChanged => "workflow_status_changed",
            Self::WorkflowDeleted => "workflow_deleted",
            Self::StepStatusChanged => "step_status_changed",
            Self::StepRetryScheduled => "step_retry_scheduled",
            Self::StepResultDiscarded => "step_result_discarded",
            Self::HeartbeatTimedOut => "heartbeat_timed_out",
            Self::UserInputReceived => "user_input_received",
            Self::CompensationStarted => "compensation_started",
            Self::CompensationExecuted => "compensation_executed",
            Self::CompensationFailed => "compensation_failed",
            Self::LeaseAcquired => "lease_acquired",
            Self::LeaseReleased => "lease_released",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that caused a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The service that created or deleted the workflow
    Caller,
    StepExecutor,
    SagaManager,
    RecoveryManager,
    Orchestrator,
    /// Background heartbeat timeout sweeper
    Sweeper,
    Store,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::StepExecutor => "step_executor",
            Self::SagaManager => "saga_manager",
            Self::RecoveryManager => "recovery_manager",
            Self::Orchestrator => "orchestrator",
            Self::Sweeper => "sweeper",
            Self::Store => "store",
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEventRecord {
    pub event_id: Uuid,
    pub workflow_id: Uuid,
    pub event_type: EventType,

    /// Step the event refers to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<String>,

    /// Free-form payload (errors, job contract, compensation outcome)
    #[serde(default)]
    pub details: serde_json::Value,

    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEventRecord {
    pub fn new(workflow_id: Uuid, event_type: EventType, actor: Actor) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workflow_id,
            event_type,
            step_id: None,
            from_status: None,
            to_status: None,
            details: serde_json::Value::Object(Default::default()),
            actor,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: u32) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Record the prior and new status of the transition
    pub fn with_transition(mut self, from: impl ToString, to: impl ToString) -> Self {
        self.from_status = Some(from.to_string());
        self.to_status = Some(to.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Shorthand for a workflow status change event
    pub fn status_changed(
        workflow_id: Uuid,
        from: impl ToString,
        to: impl ToString,
        actor: Actor,
    ) -> Self {
        Self::new(workflow_id, EventType::WorkflowStatusChanged, actor).with_transition(from, to)
    }

    /// Shorthand for a step status change event
    pub fn step_changed(
        workflow_id: Uuid,
        step_id: u32,
        from: impl ToString,
        to: impl ToString,
        actor: Actor,
    ) -> Self {
        Self::new(workflow_id, EventType::StepStatusChanged, actor)
            .with_step(step_id)
            .with_transition(from, to)
    }
}
