//! Step bodies and their outcomes.
//!
//! A step body is any `StepHandler`. Closures are adapted with [`step_fn`]:
//!
//! ```ignore
//! let charge = step_fn(|ctx: FlowExecutionContext| async move {
//!     let amount: i64 = ctx.get("amount").unwrap_or_default();
//!     Ok(StepOutput::new().set("charged", amount))
//! });
//! ```
//!
//! Handlers receive an owned context so the returned future is `'static`
//! and can be spawned for parallel groups and dynamic branches.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use waypoint_types::flow::StepResult;

use super::context::FlowExecutionContext;

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// Successful output of a step body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub message: Option<String>,
    pub payload: Option<Value>,
    /// Entries merged into the flow's data bag.
    pub data: BTreeMap<String, Value>,
    /// Redirect the walk to the named top-level step.
    pub jump_to: Option<String>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Write `value` under `key` in the flow's data bag.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn jump_to(mut self, step: impl Into<String>) -> Self {
        self.jump_to = Some(step.into());
        self
    }

    /// Recorded form of this output.
    pub fn to_result(&self) -> StepResult {
        StepResult::success(self.message.clone(), self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure of a step body.
///
/// `Failed` and `Timeout` are retried according to the step's retry
/// policy; the other variants fail the step immediately.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StepError::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Failed(_) | StepError::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// Body of a step.
///
/// Object-safe: the engine stores handlers as `Arc<dyn StepHandler>`.
pub trait StepHandler: Send + Sync {
    fn execute(&self, ctx: FlowExecutionContext) -> BoxFuture<'static, Result<StepOutput, StepError>>;
}

struct FnHandler<F> {
    f: F,
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(FlowExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
{
    fn execute(&self, ctx: FlowExecutionContext) -> BoxFuture<'static, Result<StepOutput, StepError>> {
        Box::pin((self.f)(ctx))
    }
}

/// Adapt an async closure into a shareable step handler.
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(FlowExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handler that succeeds without doing anything.
pub fn noop() -> Arc<dyn StepHandler> {
    step_fn(|_ctx| async { Ok(StepOutput::new()) })
}
