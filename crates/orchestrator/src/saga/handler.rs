//! Compensation handler trait and closure adapter

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{CompensationAction, Workflow};

/// What a compensation handler sees about the workflow being rolled back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationContext {
    pub workflow_id: Uuid,
    pub session_id: String,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Result the step recorded when it completed
    #[serde(default)]
    pub step_result: Option<serde_json::Value>,

    /// Why the rollback is happening
    pub reason: String,
}

impl CompensationContext {
    pub fn for_step(workflow: &Workflow, step_id: u32, reason: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow.workflow_id,
            session_id: workflow.session_id.clone(),
            user_id: workflow.user_id.clone(),
            step_result: workflow.results.get(&step_id).cloned(),
            reason: reason.into(),
        }
    }
}

/// Result of running one compensation
///
/// Failures are recorded and never retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Executed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        error: String,
    },
}

impl CompensationOutcome {
    pub fn executed() -> Self {
        Self::Executed { result: None }
    }

    pub fn executed_with(result: serde_json::Value) -> Self {
        Self::Executed {
            result: Some(result),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }
}

impl From<anyhow::Result<Option<serde_json::Value>>> for CompensationOutcome {
    fn from(result: anyhow::Result<Option<serde_json::Value>>) -> Self {
        match result {
            Ok(result) => Self::Executed { result },
            Err(e) => Self::failed(format!("{:#}", e)),
        }
    }
}

/// Undo logic for one compensation type
///
/// Registered on the [`SagaManager`](super::SagaManager).
#[async_trait]
pub trait CompensationHandler: Send + Sync + 'static {
    async fn compensate(
        &self,
        action: &CompensationAction,
        ctx: &CompensationContext,
    ) -> CompensationOutcome;
}

type BoxedCompensationFn = Arc<
    dyn Fn(CompensationAction, CompensationContext) -> Pin<Box<dyn Future<Output = CompensationOutcome> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a [`CompensationHandler`]
pub struct FnCompensationHandler {
    func: BoxedCompensationFn,
}

impl FnCompensationHandler {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(CompensationAction, CompensationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CompensationOutcome> + Send + 'static,
    {
        Self {
            func: Arc::new(move |action, ctx| Box::pin(func(action, ctx))),
        }
    }
}

#[async_trait]
impl CompensationHandler for FnCompensationHandler {
    async fn compensate(
        &self,
        action: &CompensationAction,
        ctx: &CompensationContext,
    ) -> CompensationOutcome {
        (self.func)(action.clone(), ctx.clone()).await
    }
}
