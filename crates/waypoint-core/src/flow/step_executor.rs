//! Single-step execution.
//!
//! `StepExecutor::execute` enforces, in order:
//! 1. required data presence and type (a `Validation` failure, never retried),
//! 2. idempotency (a cached outcome short-circuits the body),
//! 3. the step timeout around every attempt,
//! 4. fixed-delay retries for retryable failures,
//!
//! then runs the step's static and dynamic branches. Every attempt is
//! recorded as a `StepAttempted` audit event. Persistence of the parent flow
//! (including the critical-step save) is the flow executor's job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use waypoint_types::event::{FlowEvent, FlowEventType};
use waypoint_types::flow::{IdempotentRecord, StepResult, StepStatus};

use crate::repository::flow::FlowRepository;

use super::blueprint::{FlowBlueprint, FlowStep};
use super::branch::BranchOutcome;
use super::context::FlowExecutionContext;
use super::handler::{StepError, StepOutput};
use super::middleware::{MiddlewarePipeline, StepCompletion};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// Resolved outcome of one step.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// `Succeeded` or `Failed`.
    pub status: StepStatus,
    pub result: StepResult,
    /// Data-bag updates from the body and its branches.
    pub data: BTreeMap<String, Value>,
    pub jump_to: Option<String>,
    pub attempts: u32,
    pub error: Option<StepError>,
    /// Audit events produced while executing (attempts, cache hits, branch steps).
    pub events: Vec<FlowEvent>,
    pub cached: bool,
}

impl StepExecution {
    fn from_output(output: StepOutput, attempts: u32, events: Vec<FlowEvent>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            result: output.to_result(),
            data: output.data,
            jump_to: output.jump_to,
            attempts,
            error: None,
            events,
            cached: false,
        }
    }

    pub(crate) fn from_error(error: StepError, attempts: u32, events: Vec<FlowEvent>) -> Self {
        Self {
            status: StepStatus::Failed,
            result: StepResult::failure(error.to_string()),
            data: BTreeMap::new(),
            jump_to: None,
            attempts,
            error: Some(error),
            events,
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Fold branch outcomes into this (successful) execution.
    fn absorb_branches(&mut self, outcome: BranchOutcome) {
        let reports = serde_json::to_value(&outcome.reports).unwrap_or(Value::Null);
        let mut payload = match self.result.payload.take() {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => json!({ "result": other }),
            None => json!({}),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("branches".to_string(), reports);
            if let Some(selected) = &outcome.selected {
                map.insert("selected_branch".to_string(), json!(selected));
            }
        }
        self.result.payload = Some(payload);
        self.events.extend(outcome.events);

        let failed: Vec<&str> = outcome
            .reports
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.name.as_str())
            .collect();
        if failed.is_empty() {
            self.data.extend(outcome.data);
        } else {
            let message = format!(
                "{} of {} branches failed: {}",
                failed.len(),
                outcome.reports.len(),
                failed.join(", ")
            );
            self.status = StepStatus::Failed;
            self.result.success = false;
            self.result.message = Some(message.clone());
            self.error = Some(StepError::Failed(message));
            self.data.clear();
            self.jump_to = None;
        }
    }
}

/// Audit event recording how a step resolved.
pub(crate) fn outcome_event(
    ctx: &FlowExecutionContext,
    step: &str,
    execution: &StepExecution,
    branch: Option<&str>,
) -> FlowEvent {
    let event_type = if execution.is_success() {
        FlowEventType::StepCompleted
    } else {
        FlowEventType::StepFailed
    };
    FlowEvent::new(
        ctx.flow_id,
        event_type,
        json!({
            "step": step,
            "branch": branch,
            "attempts": execution.attempts,
            "cached": execution.cached,
            "message": execution.result.message,
            "error": execution.error_message(),
        }),
    )
}

/// Audit event recording a skipped step.
pub(crate) fn skipped_event(
    ctx: &FlowExecutionContext,
    step: &str,
    reason: &str,
    branch: Option<&str>,
) -> FlowEvent {
    FlowEvent::new(
        ctx.flow_id,
        FlowEventType::StepSkipped,
        json!({ "step": step, "branch": branch, "reason": reason }),
    )
}

// ---------------------------------------------------------------------------
// Idempotency key locks
// ---------------------------------------------------------------------------

/// One async mutex per in-flight idempotency key.
///
/// Holding the lock across lookup, execution and save means concurrent
/// invocations sharing a key run the body once; later holders find the cached
/// record. Entries are dropped once no task holds or awaits them.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    async fn acquire(self: &Arc<Self>, key: &str) -> KeyGuard {
        let lock = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        KeyGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct KeyGuard {
    locks: Arc<KeyLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual steps, including their branches.
///
/// Cheap to clone; clones share the repository, middleware and idempotency
/// key locks.
pub struct StepExecutor<R: FlowRepository> {
    repo: Arc<R>,
    middleware: Arc<MiddlewarePipeline>,
    key_locks: Arc<KeyLocks>,
}

impl<R: FlowRepository> Clone for StepExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            middleware: Arc::clone(&self.middleware),
            key_locks: Arc::clone(&self.key_locks),
        }
    }
}

impl<R: FlowRepository + 'static> StepExecutor<R> {
    pub fn new(repo: Arc<R>, middleware: Arc<MiddlewarePipeline>) -> Self {
        Self {
            repo,
            middleware,
            key_locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn middleware(&self) -> &MiddlewarePipeline {
        &self.middleware
    }

    /// Execute `step` (and its branches) against `ctx`.
    pub fn execute<'a>(
        &'a self,
        blueprint: &'a Arc<FlowBlueprint>,
        step: &'a FlowStep,
        ctx: FlowExecutionContext,
    ) -> BoxFuture<'a, StepExecution> {
        Box::pin(self.execute_inner(blueprint, step, ctx))
    }

    async fn execute_inner(
        &self,
        blueprint: &Arc<FlowBlueprint>,
        step: &FlowStep,
        ctx: FlowExecutionContext,
    ) -> StepExecution {
        let ctx = ctx.with_step(step.name.as_str());
        let started = Instant::now();
        let mut events = Vec::new();

        // 1. Required data
        let missing = check_required_data(step, &ctx);
        if !missing.is_empty() {
            let execution =
                StepExecution::from_error(StepError::Validation(missing.join("; ")), 0, events);
            self.finish(step, &ctx, &execution, started).await;
            return execution;
        }

        // 2. Idempotency
        let cache_key = step
            .idempotency
            .as_ref()
            .map(|key| format!("{}:{}", ctx.flow_type, key.resolve(&ctx)));
        let _key_guard = match &cache_key {
            Some(key) => Some(self.key_locks.acquire(key).await),
            None => None,
        };
        if let Some(key) = &cache_key {
            match self.repo.get_idempotent_result(key).await {
                Ok(Some(record)) => {
                    tracing::debug!(flow_id = %ctx.flow_id, step = step.name.as_str(), key, "idempotent cache hit");
                    events.push(FlowEvent::new(
                        ctx.flow_id,
                        FlowEventType::StepCacheHit,
                        json!({ "step": step.name, "key": key }),
                    ));
                    let execution = StepExecution {
                        status: if record.result.success {
                            StepStatus::Succeeded
                        } else {
                            StepStatus::Failed
                        },
                        error: (!record.result.success).then(|| {
                            StepError::Failed(record.result.message.clone().unwrap_or_default())
                        }),
                        result: record.result,
                        data: record.data,
                        jump_to: None,
                        attempts: 0,
                        events,
                        cached: true,
                    };
                    self.finish(step, &ctx, &execution, started).await;
                    return execution;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        flow_id = %ctx.flow_id,
                        step = step.name.as_str(),
                        error = %e,
                        "idempotency lookup failed; executing step"
                    );
                }
            }
        }

        if let Err(e) = self.middleware.before(&step.name, &ctx).await {
            let execution = StepExecution::from_error(e, 0, events);
            self.finish(step, &ctx, &execution, started).await;
            return execution;
        }

        // 3 + 4. Attempts with timeout and retries
        let mut attempt = 0;
        let outcome = loop {
            if attempt > 0 && ctx.is_cancelled() {
                break Err(StepError::Cancelled);
            }
            attempt += 1;
            let result = self.invoke(step, ctx.clone().with_attempt(attempt)).await;
            events.push(attempt_event(&ctx, step, attempt, &result));

            match result {
                Ok(output) => break Ok(output),
                Err(err) => {
                    if RetryHandler::should_retry(&step.retry, attempt, &err) && !ctx.is_cancelled() {
                        tracing::info!(
                            flow_id = %ctx.flow_id,
                            step = step.name.as_str(),
                            attempt,
                            max_retries = step.retry.max_retries,
                            error = %err,
                            "retrying step"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(step.retry.delay) => continue,
                            _ = ctx.cancellation().cancelled() => break Err(StepError::Cancelled),
                        }
                    }
                    break Err(err);
                }
            }
        };

        let mut execution = match outcome {
            Ok(output) => {
                let mut execution = StepExecution::from_output(output, attempt, events);
                if step.has_branches() || step.dynamic.is_some() {
                    let mut branch_ctx = ctx.clone();
                    branch_ctx.merge(&execution.data);
                    let branches = self.run_branches(blueprint, step, branch_ctx).await;
                    execution.absorb_branches(branches);
                }
                execution
            }
            Err(err) => StepExecution::from_error(err, attempt, events),
        };

        if execution.is_success() {
            if let Some(key) = &cache_key {
                let record = IdempotentRecord::new(execution.result.clone(), execution.data.clone());
                if let Err(e) = self.repo.save_idempotent_result(key, &record).await {
                    tracing::warn!(
                        flow_id = %ctx.flow_id,
                        step = step.name.as_str(),
                        error = %e,
                        "failed to store idempotent result"
                    );
                }
            }
        }

        execution.attempts = attempt;
        self.finish(step, &ctx, &execution, started).await;
        execution
    }

    /// One attempt of the step body, raced against the step timeout.
    async fn invoke(&self, step: &FlowStep, ctx: FlowExecutionContext) -> Result<StepOutput, StepError> {
        let body = step.handler.execute(ctx);
        match step.timeout {
            Some(limit) => tokio::time::timeout(limit, body)
                .await
                .unwrap_or(Err(StepError::Timeout(limit))),
            None => body.await,
        }
    }

    async fn finish(
        &self,
        step: &FlowStep,
        ctx: &FlowExecutionContext,
        execution: &StepExecution,
        started: Instant,
    ) {
        let completion = StepCompletion {
            success: execution.is_success(),
            error: execution.error_message(),
            attempts: execution.attempts,
            elapsed: started.elapsed(),
            cached: execution.cached,
        };
        self.middleware.after(&step.name, ctx, &completion).await;
    }
}

fn check_required_data(step: &FlowStep, ctx: &FlowExecutionContext) -> Vec<String> {
    step.required_data
        .iter()
        .filter_map(|(key, data_type)| match ctx.value(key) {
            None => Some(format!("required data '{key}' is missing")),
            Some(value) if !data_type.matches(value) => {
                Some(format!("required data '{key}' is not of type {data_type}"))
            }
            Some(_) => None,
        })
        .collect()
}

fn attempt_event(
    ctx: &FlowExecutionContext,
    step: &FlowStep,
    attempt: u32,
    result: &Result<StepOutput, StepError>,
) -> FlowEvent {
    let (outcome, error) = match result {
        Ok(_) => ("succeeded", None),
        Err(e) => ("failed", Some(e.to_string())),
    };
    FlowEvent::new(
        ctx.flow_id,
        FlowEventType::StepAttempted,
        json!({
            "step": step.name,
            "branch": ctx.branch.as_ref().map(|b| b.branch.as_str()),
            "attempt": attempt,
            "outcome": outcome,
            "error": error,
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use dashmap::DashMap;
    use uuid::Uuid;
    use waypoint_types::error::RepositoryError;
    use waypoint_types::flow::{DataType, FlowInstance, FlowStatus, FlowSummary};
    use waypoint_types::query::{FlowFilter, Page};

    use crate::flow::blueprint::FlowBlueprintBuilder;

    /// Minimal repository for unit tests: only the idempotency cache works.
    #[derive(Default)]
    pub(crate) struct CacheOnlyRepo {
        pub records: DashMap<String, IdempotentRecord>,
    }

    impl FlowRepository for CacheOnlyRepo {
        async fn load_flow(&self, _id: &Uuid) -> Result<Option<FlowInstance>, RepositoryError> {
            Ok(None)
        }
        async fn save_flow(&self, flow: &FlowInstance) -> Result<u64, RepositoryError> {
            Ok(flow.version + 1)
        }
        async fn get_flow_status(&self, _id: &Uuid) -> Result<Option<FlowStatus>, RepositoryError> {
            Ok(None)
        }
        async fn cancel_flow(&self, _id: &Uuid, _reason: &str) -> Result<bool, RepositoryError> {
            Ok(false)
        }
        async fn query_flows(&self, filter: &FlowFilter) -> Result<Page<FlowSummary>, RepositoryError> {
            Ok(Page::empty(filter.offset, filter.limit.unwrap_or(50)))
        }
        async fn get_paused_flows_for_auto_resume(&self) -> Result<Vec<FlowInstance>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn list_paused_flows(&self) -> Result<Vec<FlowInstance>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn cleanup_completed(
            &self,
            _older_than: chrono::DateTime<chrono::Utc>,
        ) -> Result<usize, RepositoryError> {
            Ok(0)
        }
        async fn save_event(&self, _event: &FlowEvent) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn get_events(&self, _flow_id: &Uuid) -> Result<Vec<FlowEvent>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn get_idempotent_result(&self, key: &str) -> Result<Option<IdempotentRecord>, RepositoryError> {
            Ok(self.records.get(key).map(|r| r.clone()))
        }
        async fn save_idempotent_result(
            &self,
            key: &str,
            record: &IdempotentRecord,
        ) -> Result<(), RepositoryError> {
            self.records.insert(key.to_string(), record.clone());
            Ok(())
        }
    }

    pub(crate) fn executor() -> (StepExecutor<CacheOnlyRepo>, Arc<CacheOnlyRepo>) {
        let repo = Arc::new(CacheOnlyRepo::default());
        let exec = StepExecutor::new(Arc::clone(&repo), Arc::new(MiddlewarePipeline::standard()));
        (exec, repo)
    }

    fn blueprint_of(step: FlowStep) -> Arc<FlowBlueprint> {
        Arc::new(FlowBlueprintBuilder::new("order").step(step).build())
    }

    fn count_attempts(execution: &StepExecution) -> usize {
        execution
            .events
            .iter()
            .filter(|e| e.event_type == FlowEventType::StepAttempted)
            .count()
    }

    #[tokio::test]
    async fn missing_required_data_is_validation_failure_without_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("charge", move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepOutput::new()) }
            })
            .requires("amount", DataType::Integer)
            .retry(3, Duration::ZERO),
        );
        let (exec, _) = executor();
        let ctx = FlowExecutionContext::detached("order", "alice").with_data("amount", "ten");

        let out = exec.execute(&bp, bp.top_step(0).unwrap(), ctx).await;
        assert!(!out.is_success());
        assert!(matches!(out.error, Some(StepError::Validation(ref m)) if m.contains("not of type integer")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(count_attempts(&out), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_records_each_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("flaky", move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StepError::failed(format!("attempt {n} failed")))
                    } else {
                        Ok(StepOutput::new().set("ok", true))
                    }
                }
            })
            .retry(2, Duration::from_millis(100)),
        );
        let (exec, _) = executor();
        let started = tokio::time::Instant::now();

        let out = exec
            .execute(&bp, bp.top_step(0).unwrap(), FlowExecutionContext::detached("order", "alice"))
            .await;

        assert!(out.is_success());
        assert_eq!(out.attempts, 3);
        assert_eq!(count_attempts(&out), 3);
        assert_eq!(out.data["ok"], json!(true));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("charge", move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(StepError::fatal("card declined")) }
            })
            .retry(5, Duration::ZERO),
        );
        let (exec, _) = executor();
        let out = exec
            .execute(&bp, bp.top_step(0).unwrap(), FlowExecutionContext::detached("order", "alice"))
            .await;
        assert!(!out.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_attempt() {
        let bp = blueprint_of(
            FlowStep::from_fn("slow", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(StepOutput::new())
            })
            .timeout(Duration::from_secs(1)),
        );
        let (exec, _) = executor();
        let out = exec
            .execute(&bp, bp.top_step(0).unwrap(), FlowExecutionContext::detached("order", "alice"))
            .await;
        assert!(matches!(out.error, Some(StepError::Timeout(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn idempotent_step_runs_body_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("charge", move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(StepOutput::new().message("charged").set("charge_no", n)) }
            })
            .idempotent_by(|ctx| format!("charge-{}", ctx.get_str("order_id").unwrap_or_default())),
        );
        let (exec, repo) = executor();
        let ctx = FlowExecutionContext::detached("order", "alice").with_data("order_id", "o-1");

        let first = exec.execute(&bp, bp.top_step(0).unwrap(), ctx.clone()).await;
        let second = exec.execute(&bp, bp.top_step(0).unwrap(), ctx).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.cached);
        assert_eq!(first.result, second.result);
        assert_eq!(second.data["charge_no"], json!(0));
        assert!(repo.records.contains_key("order:charge-o-1"));
        assert!(second.events.iter().any(|e| e.event_type == FlowEventType::StepCacheHit));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_invocations_with_one_key_run_body_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("charge", move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(StepOutput::new().set("charged", true))
                }
            })
            .idempotent("charge-order-1"),
        );
        let (exec, repo) = executor();
        let step = bp.top_step(0).unwrap();
        let ctx = FlowExecutionContext::detached("order", "alice");

        let outcomes = futures_util::future::join_all(
            (0..3).map(|_| exec.execute(&bp, step, ctx.clone())),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcomes.iter().all(StepExecution::is_success));
        assert_eq!(outcomes.iter().filter(|o| o.cached).count(), 2);
        assert!(outcomes.iter().all(|o| o.data["charged"] == json!(true)));
        assert!(repo.records.contains_key("order:charge-order-1"));
        assert_eq!(exec.key_locks.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_retry_delay_stops_without_another_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let bp = blueprint_of(
            FlowStep::from_fn("charge", move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(StepError::failed("gateway unavailable")) }
            })
            .retry(1, Duration::from_secs(3)),
        );
        let (exec, _) = executor();
        let ctx = FlowExecutionContext::detached("order", "alice");
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let started = tokio::time::Instant::now();

        let out = exec.execute(&bp, bp.top_step(0).unwrap(), ctx).await;

        assert_eq!(out.error, Some(StepError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(count_attempts(&out), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_context_refuses_step() {
        let bp = blueprint_of(FlowStep::from_fn("charge", |_ctx| async { Ok(StepOutput::new()) }));
        let (exec, _) = executor();
        let ctx = FlowExecutionContext::detached("order", "alice");
        ctx.cancellation().cancel();
        let out = exec.execute(&bp, bp.top_step(0).unwrap(), ctx).await;
        assert_eq!(out.error, Some(StepError::Cancelled));
    }
}
