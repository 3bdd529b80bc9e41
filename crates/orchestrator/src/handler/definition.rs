//! Step handler trait and execution results

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StepContext;
use crate::workflow::{Step, StepResults};

/// Why a step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// No handler registered for the step's action type (never retried)
    NoHandler,

    /// The handler raised or returned a failure
    StepFailed,

    /// A declared precondition did not hold before dispatch (never retried)
    PreconditionFailed,

    /// The step went silent or overran its deadline
    Timeout,

    /// The workflow was cancelled while the step was pending
    UserCancelled,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoHandler => "no_handler",
            Self::StepFailed => "step_failed",
            Self::PreconditionFailed => "precondition_failed",
            Self::Timeout => "timeout",
            Self::UserCancelled => "user_cancelled",
        };
        f.write_str(s)
    }
}

/// Error value describing a step failure
///
/// Failures are values: the executor records them on the step and returns
/// them to the orchestration loop instead of propagating an `Err`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub kind: StepErrorKind,

    pub message: String,

    /// Whether the executor may retry the step
    ///
    /// Non-retryable errors fail the step without further attempts.
    pub retryable: bool,

    /// Additional details (for debugging)
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// A transient handler failure that should be retried
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::StepFailed,
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// A permanent handler failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::StepFailed,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn no_handler(action_type: &str) -> Self {
        Self {
            kind: StepErrorKind::NoHandler,
            message: format!("no handler registered for action type: {}", action_type),
            retryable: false,
            details: None,
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::PreconditionFailed,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Timeout,
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    pub fn user_cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::UserCancelled,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// What a handler produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Step completed; the value is stored under the step id
    Success { result: serde_json::Value },

    /// Step failed; may be retried depending on `error.retryable`
    Failure { error: StepError },

    /// Step needs a reply from the user before it can run
    AwaitingInput { prompt: String },
}

impl ExecutionResult {
    pub fn success(result: serde_json::Value) -> Self {
        Self::Success { result }
    }

    pub fn failure(error: StepError) -> Self {
        Self::Failure { error }
    }

    pub fn awaiting_input(prompt: impl Into<String>) -> Self {
        Self::AwaitingInput {
            prompt: prompt.into(),
        }
    }
}

impl From<Result<serde_json::Value, StepError>> for ExecutionResult {
    fn from(result: Result<serde_json::Value, StepError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(error) => Self::failure(error),
        }
    }
}

/// Business-specific implementation of one action type
///
/// Handlers are registered on the [`StepExecutor`](crate::engine::StepExecutor)
/// and receive the step together with a read-only view of earlier results.
///
/// # Example
///
/// ```ignore
/// struct KnowledgeLookup { index: SearchIndex }
///
/// #[async_trait]
/// impl StepHandler for KnowledgeLookup {
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         step: &Step,
///         previous: &StepResults,
///     ) -> ExecutionResult {
///         match self.index.search(&step.instruction).await {
///             Ok(hits) => ExecutionResult::success(json!({ "hits": hits })),
///             Err(e) => ExecutionResult::failure(StepError::retryable(e.to_string())),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Run the step
    async fn execute(
        &self,
        ctx: &StepContext,
        step: &Step,
        previous: &StepResults,
    ) -> ExecutionResult;

    /// Checked before dispatch; an `Err` fails the step without retrying
    fn check_precondition(&self, _step: &Step, _previous: &StepResults) -> Result<(), String> {
        Ok(())
    }

    /// Whether re-running the handler after a crash is safe
    ///
    /// Recovery re-attempts an in-flight step only when this returns true;
    /// otherwise the step is treated as failed.
    fn is_idempotent(&self) -> bool {
        true
    }
}

/// Owned arguments passed to closure handlers
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub ctx: StepContext,
    pub step: Step,
    pub previous: StepResults,
}

type BoxedStepFn = Arc<
    dyn Fn(StepInvocation) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send>> + Send + Sync,
>;

/// Adapter turning an async closure into a [`StepHandler`]
pub struct FnStepHandler {
    func: BoxedStepFn,
    idempotent: bool,
}

impl FnStepHandler {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |invocation| Box::pin(func(invocation))),
            idempotent: true,
        }
    }

    /// Mark the handler as unsafe to re-run after a crash
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

#[async_trait]
impl StepHandler for FnStepHandler {
    async fn execute(
        &self,
        ctx: &StepContext,
        step: &Step,
        previous: &StepResults,
    ) -> ExecutionResult {
        (self.func)(StepInvocation {
            ctx: ctx.clone(),
            step: step.clone(),
            previous: previous.clone(),
        })
        .await
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_constructors() {
        let error = StepError::retryable("connection reset");
        assert!(error.retryable);
        assert_eq!(error.kind, StepErrorKind::StepFailed);

        let error = StepError::no_handler("data_query");
        assert!(!error.retryable);
        assert_eq!(error.kind, StepErrorKind::NoHandler);
        assert!(error.message.contains("data_query"));

        assert!(!StepError::precondition_failed("missing input").retryable);
        assert!(StepError::timeout("silent").retryable);
    }

    #[test]
    fn test_step_error_display() {
        let error = StepError::non_retryable("bad instruction");
        assert_eq!(error.to_string(), "step_failed: bad instruction");
    }

    #[test]
    fn test_from_anyhow_is_retryable() {
        let error: StepError = anyhow::anyhow!("upstream unavailable").into();
        assert!(error.retryable);
        assert_eq!(error.message, "upstream unavailable");
    }

    #[test]
    fn test_execution_result_from_result() {
        let ok: ExecutionResult = Ok(serde_json::json!({"rows": 3})).into();
        assert!(matches!(ok, ExecutionResult::Success { .. }));

        let err: ExecutionResult = Err(StepError::retryable("x")).into();
        assert!(matches!(err, ExecutionResult::Failure { .. }));
    }

    #[test]
    fn test_execution_result_serialization() {
        let result = ExecutionResult::awaiting_input("Which region?");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "awaiting_input");
        assert_eq!(json["prompt"], "Which region?");
    }
}
