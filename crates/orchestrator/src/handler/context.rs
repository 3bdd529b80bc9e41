//! Step execution context

use uuid::Uuid;

/// Context provided to step handlers during execution
///
/// Carries the identity of the attempt and, when the workflow was resumed
/// after a pause, the user's reply for this step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Workflow instance that owns the step
    pub workflow_id: Uuid,

    /// Session (conversation) the workflow belongs to
    pub session_id: String,

    pub step_id: u32,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed (initial attempt + retries)
    pub max_attempts: u32,

    /// Reply supplied on resume, if the step asked for input
    pub user_response: Option<String>,
}

impl StepContext {
    pub fn new(
        workflow_id: Uuid,
        session_id: impl Into<String>,
        step_id: u32,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            workflow_id,
            session_id: session_id.into(),
            step_id,
            attempt,
            max_attempts,
            user_response: None,
        }
    }

    pub fn with_user_response(mut self, response: Option<String>) -> Self {
        self.user_response = response;
        self
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Check if this attempt is a retry
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}
